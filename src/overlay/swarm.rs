//! libp2p swarm task: gossip, DHT discovery and the command loop.

use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::overlay::{InboundMessage, NodeId, OverlayCommand, OverlayError, OverlayHandle};

const PROTOCOL_VERSION: &str = "/faasmesh/1.0.0";

#[derive(NetworkBehaviour)]
struct AgentBehaviour {
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
}

/// Build the libp2p host, join the pub/sub topic, contact the bootstrap
/// nodes and hand the event loop to a background task.
///
/// Returns the command handle, the inbound message stream and the task
/// handle. The task ends when every [`OverlayHandle`] has been dropped.
pub async fn spawn(
    config: &AgentConfig,
    keypair: Keypair,
) -> Result<
    (
        OverlayHandle,
        mpsc::Receiver<InboundMessage>,
        JoinHandle<Result<(), OverlayError>>,
    ),
    OverlayError,
> {
    let local_peer = keypair.public().to_peer_id();
    let mdns_enabled = config.mdns_enabled;

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| OverlayError::Transport(e.to_string()))?
        .with_behaviour(|key| {
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub::Config::default(),
            )?;

            let kademlia = kad::Behaviour::new(
                local_peer,
                MemoryStore::new(key.public().to_peer_id()),
            );

            let identify = identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.to_string(),
                key.public(),
            ));

            let mdns = if mdns_enabled {
                Toggle::from(Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?))
            } else {
                Toggle::from(None)
            };

            Ok(AgentBehaviour {
                gossipsub,
                kademlia,
                identify,
                mdns,
            })
        })
        .map_err(|e| OverlayError::Transport(e.to_string()))?
        .build();

    // Nodes both provide and look up the rendezvous key.
    swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let topic = gossipsub::IdentTopic::new(config.pubsub_topic.clone());
    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&topic)
        .map_err(|e| OverlayError::Transport(e.to_string()))?;

    for addr in &config.listen {
        let parsed: Multiaddr = addr.parse().map_err(|e: libp2p::multiaddr::Error| {
            OverlayError::BadAddress {
                addr: addr.clone(),
                reason: e.to_string(),
            }
        })?;
        swarm
            .listen_on(parsed)
            .map_err(|e| OverlayError::Transport(e.to_string()))?;
    }

    if config.bootstrap_nodes {
        bootstrap(&mut swarm, config)?;
    }

    let rendezvous_key = kad::RecordKey::new(&config.rendezvous.as_bytes());
    if let Err(e) = swarm
        .behaviour_mut()
        .kademlia
        .start_providing(rendezvous_key.clone())
    {
        // Fails only without known peers; the periodic discovery loop
        // re-publishes once the routing table fills up.
        debug!(error = %e, "provider record not published yet");
    }

    let (command_tx, command_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);

    let kad_idle = config.kad_idle_time;
    let task = tokio::spawn(run_event_loop(
        swarm,
        topic,
        command_rx,
        inbound_tx,
        rendezvous_key,
        kad_idle,
        local_peer,
    ));

    let handle = OverlayHandle::new(command_tx, NodeId::from(local_peer.to_base58()));
    Ok((handle, inbound_rx, task))
}

/// Contact the configured bootstrap nodes and seed the routing table.
fn bootstrap(swarm: &mut Swarm<AgentBehaviour>, config: &AgentConfig) -> Result<(), OverlayError> {
    let mut addresses: Vec<String> = config.bootstrap_nodes_list.clone();

    if let Some(path) = &config.bootstrap_nodes_file {
        let content = std::fs::read_to_string(path).map_err(|e| OverlayError::Bootstrap {
            addr: path.display().to_string(),
            reason: e.to_string(),
        })?;
        addresses.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }

    for addr in addresses {
        let parsed: Multiaddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                return Err(OverlayError::BadAddress {
                    addr,
                    reason: e.to_string(),
                })
            }
        };

        let Some((peer, base)) = split_peer_id(&parsed) else {
            return Err(OverlayError::BadAddress {
                addr,
                reason: "bootstrap address must end with a /p2p/ peer id".into(),
            });
        };

        swarm.behaviour_mut().kademlia.add_address(&peer, base);
        match swarm.dial(parsed) {
            Ok(()) => info!(%addr, "dialing bootstrap node"),
            Err(e) if config.bootstrap_force => {
                return Err(OverlayError::Bootstrap {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(e) => warn!(%addr, error = %e, "cannot dial bootstrap node"),
        }
    }

    if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
        warn!(error = %e, "DHT bootstrap not started");
    }
    Ok(())
}

/// Split `/…/p2p/<id>` into the peer id and the transport address.
fn split_peer_id(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(peer)) => Some((peer, base)),
        _ => None,
    }
}

async fn run_event_loop(
    mut swarm: Swarm<AgentBehaviour>,
    topic: gossipsub::IdentTopic,
    mut commands: mpsc::Receiver<OverlayCommand>,
    inbound: mpsc::Sender<InboundMessage>,
    rendezvous_key: kad::RecordKey,
    kad_idle: Duration,
    local_peer: PeerId,
) -> Result<(), OverlayError> {
    let mut discovery = tokio::time::interval(kad_idle.max(Duration::from_secs(1)));
    discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => {
                    debug!("all overlay handles dropped, stopping swarm task");
                    return Ok(());
                }
                Some(OverlayCommand::Publish { data, reply }) => {
                    let result = match swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                        Ok(_) => Ok(()),
                        // A federation of one still publishes into the void.
                        Err(gossipsub::PublishError::InsufficientPeers) => {
                            debug!("no peers subscribed to the topic");
                            Ok(())
                        }
                        Err(e) => Err(OverlayError::Publish(e.to_string())),
                    };
                    let _ = reply.send(result);
                }
                Some(OverlayCommand::ConnectedPeers { reply }) => {
                    let mut peers: Vec<NodeId> = swarm
                        .connected_peers()
                        .map(|p| NodeId::from(p.to_base58()))
                        .collect();
                    peers.sort();
                    peers.dedup();
                    let _ = reply.send(peers);
                }
            },
            _ = discovery.tick() => {
                swarm.behaviour_mut().kademlia.get_providers(rendezvous_key.clone());
                if let Err(e) = swarm.behaviour_mut().kademlia.start_providing(rendezvous_key.clone()) {
                    debug!(error = %e, "provider record not refreshed");
                }
            }
            event = swarm.select_next_some() => {
                if handle_event(&mut swarm, event, &inbound, local_peer).await.is_err() {
                    // Inbound consumer is gone: the agent is shutting down.
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_event(
    swarm: &mut Swarm<AgentBehaviour>,
    event: SwarmEvent<AgentBehaviourEvent>,
    inbound: &mpsc::Sender<InboundMessage>,
    local_peer: PeerId,
) -> Result<(), ()> {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(address = %address.clone().with(Protocol::P2p(local_peer)), "overlay listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!(peer = %peer_id, "peer connected");
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            debug!(peer = %peer_id, ?cause, "peer disconnected");
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let sender = message.source.unwrap_or(propagation_source);
            if sender != local_peer {
                inbound
                    .send(InboundMessage {
                        sender: NodeId::from(sender.to_base58()),
                        data: message.data,
                    })
                    .await
                    .map_err(|_| ())?;
            }
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer, addr) in peers {
                debug!(%peer, %addr, "peer discovered via mDNS");
                swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                let _ = swarm.dial(addr);
            }
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Kademlia(
            kad::Event::OutboundQueryProgressed {
                result:
                    kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                        providers,
                        ..
                    })),
                ..
            },
        )) => {
            for peer in providers {
                if peer != local_peer && !swarm.is_connected(&peer) {
                    debug!(%peer, "rendezvous provider found, dialing");
                    let _ = swarm.dial(peer);
                }
            }
        }
        SwarmEvent::Behaviour(AgentBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
        _ => {}
    }
    Ok(())
}
