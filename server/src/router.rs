//! Envelope routing for the chat server
//!
//! Every decoded envelope lands here. The router classifies by type and
//! either broadcasts to the whole roster (optionally excluding the sender)
//! or relays to one named session:
//! - `CHAT` to "general" fans out to everyone but the sender
//! - `CHAT` to a user goes to that user alone, with a `SYSTEM` notice back
//!   to the sender when the user is unknown
//! - `SET_AVATAR` is validated against the avatar listing before the
//!   updated mapping is broadcast
//! - the `GAME_*` family is relayed best-effort to the named opponent
//!
//! The router also owns the join and leave announcement sequences. All
//! delivery happens through registry snapshots, outside the registry lock;
//! a send failure marks that peer dead and its departure is announced to
//! the survivors like any other disconnect.

use crate::avatars::AvatarProvider;
use crate::registry::{ConnId, Peer, Registry};
use log::{debug, info, warn};
use shared::{encode, Envelope, GENERAL_CHAT};
use std::sync::Arc;

pub struct Router {
    registry: Arc<Registry>,
    avatars: Arc<dyn AvatarProvider>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, avatars: Arc<dyn AvatarProvider>) -> Self {
        Self { registry, avatars }
    }

    /// Handles one envelope received from a registered client.
    ///
    /// `sender_name` is the handshake-registered username, which overrides
    /// whatever identity the payload claims wherever the server injects the
    /// sender (private chat, game invites).
    pub fn dispatch(&self, sender_id: ConnId, sender_name: &str, envelope: Envelope) {
        match envelope {
            Envelope::Chat {
                sender,
                recipient,
                text,
            } => {
                if recipient == GENERAL_CHAT {
                    self.broadcast(
                        &Envelope::Chat {
                            sender,
                            recipient,
                            text,
                        },
                        Some(sender_id),
                    );
                } else {
                    self.send_private(sender_id, sender_name, &recipient, text);
                }
            }

            Envelope::SetAvatar { avatar } => {
                if !avatar.is_empty() {
                    self.handle_avatar_change(sender_id, sender_name, &avatar);
                }
            }

            Envelope::GameInvite { opponent } => {
                if !opponent.is_empty() {
                    // The invitee learns who is inviting, not whom they named.
                    self.relay(
                        &opponent,
                        Envelope::GameInvite {
                            opponent: sender_name.to_string(),
                        },
                    );
                }
            }

            Envelope::GameAccepted {
                player,
                symbol,
                opponent,
            } => {
                if let Some(opponent) = named(opponent) {
                    self.relay(
                        &opponent,
                        Envelope::GameAccepted {
                            player,
                            symbol,
                            opponent: None,
                        },
                    );
                }
            }

            Envelope::GameMove {
                board,
                current_player,
                opponent,
            } => {
                if let Some(opponent) = named(opponent) {
                    self.relay(
                        &opponent,
                        Envelope::GameMove {
                            board,
                            current_player,
                            opponent: None,
                        },
                    );
                }
            }

            Envelope::GameEnd { result, opponent } => {
                if let Some(opponent) = named(opponent) {
                    self.relay(
                        &opponent,
                        Envelope::GameEnd {
                            result,
                            opponent: None,
                        },
                    );
                }
            }

            Envelope::GameReset {
                player,
                symbol,
                opponent,
            } => {
                if let Some(opponent) = named(opponent) {
                    self.relay(
                        &opponent,
                        Envelope::GameReset {
                            player,
                            symbol,
                            opponent: None,
                        },
                    );
                }
            }

            Envelope::GameLeft { player, opponent } => {
                if let Some(opponent) = named(opponent) {
                    self.relay(
                        &opponent,
                        Envelope::GameLeft {
                            player,
                            opponent: None,
                        },
                    );
                }
            }

            // Server-emitted types arriving from a client are dropped.
            other => {
                debug!("Ignoring client-sent {:?} from '{}'", kind(&other), sender_name);
            }
        }
    }

    /// Announces a freshly registered session to the roster.
    ///
    /// Order matters to clients: the `SYSTEM` notice and roster go to
    /// everyone, then the newcomer is caught up with every known avatar
    /// mapping, then the newcomer's own avatar is broadcast so existing
    /// clients learn just the one new mapping.
    pub fn handle_join(&self, username: &str) {
        info!("Client '{}' joined the chat", username);

        self.broadcast(
            &Envelope::system(format!("{} joined the chat", username)),
            None,
        );
        self.broadcast_userlist();

        if let Some(peer) = self.registry.find_by_username(username) {
            for (user, avatar) in self.registry.avatars_snapshot() {
                self.send_to(
                    &peer,
                    &Envelope::Avatar {
                        username: user,
                        avatar,
                    },
                );
            }
        }

        if let Some(avatar) = self.registry.avatar_of(username) {
            self.broadcast(
                &Envelope::Avatar {
                    username: username.to_string(),
                    avatar,
                },
                None,
            );
        }
    }

    /// Unregisters a connection and announces the departure exactly once.
    ///
    /// Safe to call from both the connection's own read loop and broadcast
    /// failure handling; whoever loses the unregister race does nothing.
    pub fn handle_disconnect(&self, id: ConnId) {
        self.drop_clients(vec![id]);
    }

    /// Broadcasts one envelope to every registered session, skipping
    /// `exclude`. Peers whose queue has gone away are disconnected and
    /// their departure announced; delivery to the rest is unaffected.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnId>) {
        let Some(frame) = frame(envelope) else { return };
        let failed = self.broadcast_frame(&frame, exclude);
        self.drop_clients(failed);
    }

    fn broadcast_userlist(&self) {
        self.broadcast(
            &Envelope::Userlist {
                users: self.registry.usernames(),
            },
            None,
        );
    }

    fn send_private(&self, sender_id: ConnId, sender_name: &str, recipient: &str, text: String) {
        match self.registry.find_by_username(recipient) {
            Some(target) => {
                self.send_to(
                    &target,
                    &Envelope::Chat {
                        sender: sender_name.to_string(),
                        recipient: recipient.to_string(),
                        text,
                    },
                );
            }
            None => {
                if let Some(sender) = self.registry.peer(sender_id) {
                    self.send_to(
                        &sender,
                        &Envelope::system(format!("User {} not found", recipient)),
                    );
                }
            }
        }
    }

    fn handle_avatar_change(&self, sender_id: ConnId, sender_name: &str, avatar: &str) {
        if !self.avatars.available().iter().any(|name| name == avatar) {
            debug!("Client '{}' requested unknown avatar '{}'", sender_name, avatar);
            if let Some(sender) = self.registry.peer(sender_id) {
                self.send_to(&sender, &Envelope::AvatarError {});
            }
            return;
        }

        if !self.registry.set_avatar(sender_name, avatar) {
            return;
        }
        self.broadcast(
            &Envelope::Avatar {
                username: sender_name.to_string(),
                avatar: avatar.to_string(),
            },
            None,
        );
    }

    /// Forwards a game envelope to the named opponent, or drops it.
    fn relay(&self, opponent: &str, envelope: Envelope) {
        match self.registry.find_by_username(opponent) {
            Some(target) => self.send_to(&target, &envelope),
            None => debug!("Dropping game message for unknown opponent '{}'", opponent),
        }
    }

    fn send_to(&self, peer: &Peer, envelope: &Envelope) {
        let Some(frame) = frame(envelope) else { return };
        if peer.sender.send(frame).is_err() {
            self.drop_clients(vec![peer.id]);
        }
    }

    /// Queues a frame to every peer except `exclude`, returning the ids
    /// whose queue was closed. Never mutates the registry itself.
    fn broadcast_frame(&self, frame: &[u8], exclude: Option<ConnId>) -> Vec<ConnId> {
        let mut failed = Vec::new();
        for peer in self.registry.snapshot() {
            if Some(peer.id) == exclude {
                continue;
            }
            if peer.sender.send(frame.to_vec()).is_err() {
                failed.push(peer.id);
            }
        }
        failed
    }

    /// Unregisters each queued connection and announces its departure.
    ///
    /// Announcing can itself surface newly dead peers; those feed back into
    /// the queue until the roster is quiet. Unregister is idempotent, so a
    /// connection queued twice is announced once.
    fn drop_clients(&self, mut queue: Vec<ConnId>) {
        while let Some(id) = queue.pop() {
            let Some(username) = self.registry.unregister(id) else {
                continue;
            };
            info!("Client '{}' left the chat", username);
            queue.extend(self.announce_left(&username));
        }
    }

    fn announce_left(&self, username: &str) -> Vec<ConnId> {
        let mut failed = Vec::new();

        if let Some(frame) = frame(&Envelope::system(format!("{} left the chat", username))) {
            failed.extend(self.broadcast_frame(&frame, None));
        }
        if let Some(frame) = frame(&Envelope::Userlist {
            users: self.registry.usernames(),
        }) {
            failed.extend(self.broadcast_frame(&frame, None));
        }

        failed.sort_unstable();
        failed.dedup();
        failed
    }
}

fn frame(envelope: &Envelope) -> Option<Vec<u8>> {
    match encode(envelope) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Dropping unencodable envelope: {}", e);
            None
        }
    }
}

fn named(value: Option<String>) -> Option<String> {
    value.filter(|name| !name.is_empty())
}

fn kind(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Chat { .. } => "CHAT",
        Envelope::System { .. } => "SYSTEM",
        Envelope::Userlist { .. } => "USERLIST",
        Envelope::Avatar { .. } => "AVATAR",
        Envelope::AvatarError {} => "AVATAR_ERROR",
        Envelope::SetAvatar { .. } => "SET_AVATAR",
        Envelope::GameInvite { .. } => "GAME_INVITE",
        Envelope::GameAccepted { .. } => "GAME_ACCEPTED",
        Envelope::GameMove { .. } => "GAME_MOVE",
        Envelope::GameEnd { .. } => "GAME_END",
        Envelope::GameReset { .. } => "GAME_RESET",
        Envelope::GameLeft { .. } => "GAME_LEFT",
        Envelope::Discovery { .. } => "DISCOVERY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatars::FixedAvatars;
    use shared::decode;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn setup() -> (Arc<Registry>, Router) {
        let registry = Arc::new(Registry::new());
        let avatars = Arc::new(FixedAvatars::new(vec![
            "cat.png".to_string(),
            "dog.png".to_string(),
        ]));
        let router = Router::new(Arc::clone(&registry), avatars);
        (registry, router)
    }

    fn join(
        registry: &Registry,
        router: &Router,
        name: &str,
    ) -> (ConnId, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry
            .register(name, Some("cat.png".to_string()), tx)
            .unwrap();
        router.handle_join(name);
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            let text = String::from_utf8(bytes).unwrap();
            envelopes.push(decode(&text).unwrap());
        }
        envelopes
    }

    #[test]
    fn test_general_chat_excludes_sender() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::Chat {
                sender: "alice".to_string(),
                recipient: GENERAL_CHAT.to_string(),
                text: "hello".to_string(),
            },
        );

        assert!(drain(&mut alice).is_empty());
        assert_eq!(
            drain(&mut bob),
            vec![Envelope::Chat {
                sender: "alice".to_string(),
                recipient: GENERAL_CHAT.to_string(),
                text: "hello".to_string(),
            }]
        );
    }

    #[test]
    fn test_private_chat_reaches_only_recipient() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        let (_, mut carol) = join(&registry, &router, "carol");
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut carol);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::Chat {
                sender: "alice".to_string(),
                recipient: "bob".to_string(),
                text: "hi".to_string(),
            },
        );

        assert_eq!(
            drain(&mut bob),
            vec![Envelope::Chat {
                sender: "alice".to_string(),
                recipient: "bob".to_string(),
                text: "hi".to_string(),
            }]
        );
        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut carol).is_empty());
    }

    #[test]
    fn test_private_chat_unknown_recipient_notifies_sender() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::Chat {
                sender: "alice".to_string(),
                recipient: "dave".to_string(),
                text: "hi".to_string(),
            },
        );

        assert_eq!(
            drain(&mut alice),
            vec![Envelope::system("User dave not found")]
        );
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn test_private_chat_uses_registered_sender_name() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        // A spoofed sender field is replaced with the handshake identity.
        router.dispatch(
            alice_id,
            "alice",
            Envelope::Chat {
                sender: "mallory".to_string(),
                recipient: "bob".to_string(),
                text: "pst".to_string(),
            },
        );

        assert_eq!(
            drain(&mut bob),
            vec![Envelope::Chat {
                sender: "alice".to_string(),
                recipient: "bob".to_string(),
                text: "pst".to_string(),
            }]
        );
    }

    #[test]
    fn test_join_sequence_for_existing_client() {
        let (registry, router) = setup();
        let (_, mut alice) = join(&registry, &router, "alice");
        drain(&mut alice);

        let (_, _bob_rx) = join(&registry, &router, "bob");

        assert_eq!(
            drain(&mut alice),
            vec![
                Envelope::system("bob joined the chat"),
                Envelope::Userlist {
                    users: vec!["alice".to_string(), "bob".to_string()],
                },
                Envelope::Avatar {
                    username: "bob".to_string(),
                    avatar: "cat.png".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_join_sequence_catches_up_newcomer() {
        let (registry, router) = setup();
        let (_, _alice_rx) = join(&registry, &router, "alice");

        let (_, mut bob) = join(&registry, &router, "bob");

        // The newcomer sees the announcement, the roster, every known
        // avatar mapping, then the broadcast of its own assignment.
        assert_eq!(
            drain(&mut bob),
            vec![
                Envelope::system("bob joined the chat"),
                Envelope::Userlist {
                    users: vec!["alice".to_string(), "bob".to_string()],
                },
                Envelope::Avatar {
                    username: "alice".to_string(),
                    avatar: "cat.png".to_string(),
                },
                Envelope::Avatar {
                    username: "bob".to_string(),
                    avatar: "cat.png".to_string(),
                },
                Envelope::Avatar {
                    username: "bob".to_string(),
                    avatar: "cat.png".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_disconnect_announces_once() {
        let (registry, router) = setup();
        let (alice_id, _alice_rx) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut bob);

        router.handle_disconnect(alice_id);
        router.handle_disconnect(alice_id);

        assert_eq!(
            drain(&mut bob),
            vec![
                Envelope::system("alice left the chat"),
                Envelope::Userlist {
                    users: vec!["bob".to_string()],
                },
            ]
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_survives_dead_peer() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");

        // Carol's write loop is gone; her queue rejects every send.
        let (carol_tx, carol_rx) = mpsc::unbounded_channel();
        registry.register("carol", None, carol_tx).unwrap();
        drop(carol_rx);
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::Chat {
                sender: "alice".to_string(),
                recipient: GENERAL_CHAT.to_string(),
                text: "anyone there?".to_string(),
            },
        );

        let bob_msgs = drain(&mut bob);
        assert_eq!(
            bob_msgs[0],
            Envelope::Chat {
                sender: "alice".to_string(),
                recipient: GENERAL_CHAT.to_string(),
                text: "anyone there?".to_string(),
            }
        );
        // Carol's failed delivery turned into a departure announcement.
        assert!(bob_msgs.contains(&Envelope::system("carol left the chat")));
        assert!(bob_msgs.contains(&Envelope::Userlist {
            users: vec!["alice".to_string(), "bob".to_string()],
        }));
        assert!(registry.find_by_username("carol").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_avatar_change_broadcasts_to_everyone() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::SetAvatar {
                avatar: "dog.png".to_string(),
            },
        );

        let expected = Envelope::Avatar {
            username: "alice".to_string(),
            avatar: "dog.png".to_string(),
        };
        assert_eq!(drain(&mut alice), vec![expected.clone()]);
        assert_eq!(drain(&mut bob), vec![expected]);
        assert_eq!(registry.avatar_of("alice"), Some("dog.png".to_string()));
    }

    #[test]
    fn test_avatar_rejection_answers_sender_only() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::SetAvatar {
                avatar: "missing.png".to_string(),
            },
        );

        assert_eq!(drain(&mut alice), vec![Envelope::AvatarError {}]);
        assert!(drain(&mut bob).is_empty());
        assert_eq!(registry.avatar_of("alice"), Some("cat.png".to_string()));
    }

    #[test]
    fn test_empty_set_avatar_is_ignored() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        drain(&mut alice);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::SetAvatar {
                avatar: String::new(),
            },
        );

        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn test_game_invite_carries_inviter_name() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        let (_, mut carol) = join(&registry, &router, "carol");
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut carol);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::GameInvite {
                opponent: "bob".to_string(),
            },
        );

        assert_eq!(
            drain(&mut bob),
            vec![Envelope::GameInvite {
                opponent: "alice".to_string(),
            }]
        );
        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut carol).is_empty());
    }

    #[test]
    fn test_game_relay_strips_routing_field() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        let board = vec![
            Some("X".to_string()),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        ];
        router.dispatch(
            alice_id,
            "alice",
            Envelope::GameMove {
                board: board.clone(),
                current_player: "O".to_string(),
                opponent: Some("bob".to_string()),
            },
        );

        assert_eq!(
            drain(&mut bob),
            vec![Envelope::GameMove {
                board,
                current_player: "O".to_string(),
                opponent: None,
            }]
        );
    }

    #[test]
    fn test_game_relay_to_unknown_opponent_is_dropped() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::GameEnd {
                result: "X_WINS".to_string(),
                opponent: Some("ghost".to_string()),
            },
        );

        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn test_server_emitted_types_from_clients_are_dropped() {
        let (registry, router) = setup();
        let (alice_id, mut alice) = join(&registry, &router, "alice");
        let (_, mut bob) = join(&registry, &router, "bob");
        drain(&mut alice);
        drain(&mut bob);

        router.dispatch(
            alice_id,
            "alice",
            Envelope::Userlist {
                users: vec!["fake".to_string()],
            },
        );
        router.dispatch(alice_id, "alice", Envelope::Discovery { port: 1, ip: None });

        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut bob).is_empty());
    }
}
