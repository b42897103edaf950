//! An in-process network that shuttles messages between test nodes over channels.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tenderbft::{messages::Message, node::Node, types::basic::PeerId};

/// A running test network. Owns the nodes; dropping it shuts the nodes down.
pub(crate) struct TestNetwork {
    shutdown: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

/// Start a pump thread that moves every message a node emits to its destination: broadcasts to
/// every other node, targeted messages to the named peer. Messages to unknown peers are dropped,
/// like a real transport would drop messages to disconnected ones.
pub(crate) fn start_network(
    nodes: Vec<(PeerId, Node, Receiver<(Option<PeerId>, Message)>)>,
) -> TestNetwork {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let pump = thread::spawn(move || {
        while !shutdown_flag.load(Ordering::Relaxed) {
            let mut delivered = false;
            for i in 0..nodes.len() {
                let origin = nodes[i].0;
                while let Ok((destination, message)) = nodes[i].2.try_recv() {
                    delivered = true;
                    match destination {
                        None => {
                            for (j, (_, node, _)) in nodes.iter().enumerate() {
                                if j != i {
                                    node.handle_message(message.clone(), origin);
                                }
                            }
                        }
                        Some(peer) => {
                            if let Some((_, node, _)) =
                                nodes.iter().find(|(peer_id, _, _)| *peer_id == peer)
                            {
                                node.handle_message(message, origin);
                            }
                        }
                    }
                }
            }
            if !delivered {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });
    TestNetwork {
        shutdown,
        pump: Some(pump),
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.pump.take().unwrap().join().unwrap();
    }
}
