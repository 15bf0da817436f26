use rudpmesh::{Engine, Node, TopologyConfig};
use std::time::Duration;
use tokio::time;
use tracing_subscriber::EnvFilter;

const TICK: f32 = 0.016;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rudpmesh=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = TopologyConfig::default();

    // The host plays as a node in its own mesh
    let mut host = Engine::new(config.clone(), 4)?;
    let mesh_addr = host.host_network("127.0.0.1:0".parse()?).await?;
    host.join_network("127.0.0.1:0".parse()?, mesh_addr).await?;
    println!("Mesh listening on {}", mesh_addr);

    let mut guest = Node::new(config)?;
    guest.start("127.0.0.1:0".parse()?).await?;
    guest.connect(mesh_addr);

    let mut greeted = false;
    let mut replies = 0;
    for _ in 0..2000 {
        host.update(TICK).await?;
        guest.update(TICK).await?;

        if guest.just_connected() {
            println!("Guest joined as node {:?}", guest.local_node_id());
        }

        // Guest greets every peer once it sees them
        for peer in 0..guest.num_nodes() {
            if guest.node_just_connected(peer) {
                for i in 1..=5 {
                    let message = format!("Hello from guest, message {}", i);
                    guest.send_guaranteed(peer, message.as_bytes())?;
                }
                greeted = true;
            }
            while let Some(reply) = guest.receive_guaranteed(peer) {
                println!("Guest got from {}: {}", peer, String::from_utf8_lossy(&reply));
                replies += 1;
            }
        }

        // Host echoes whatever arrives
        let node = host.node_mut();
        for peer in 0..node.num_nodes() {
            while let Some(message) = node.receive_guaranteed(peer) {
                let text = String::from_utf8_lossy(&message).into_owned();
                println!("Host got from {}: {}", peer, text);
                node.send_guaranteed(peer, format!("Echo: {}", text).as_bytes())?;
            }
        }

        if greeted && replies == 5 {
            break;
        }
        time::sleep(Duration::from_millis(16)).await;
    }

    for peer in 0..guest.num_nodes() {
        if let Some(stats) = guest.stats(peer).filter(|_| guest.is_node_connected(peer)) {
            println!("Link to node {}: {:?}", peer, stats);
            println!("  loss {:.1}%", stats.packet_loss_rate() * 100.0);
        }
    }

    host.shutdown();
    guest.stop();
    Ok(())
}
