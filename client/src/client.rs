use crate::bootstrap::{reserve_session, Reservation};
use crate::config::ClientConfig;
use crate::crypto::TokenDecryptor;
use crate::game::{BlockContext, GameSession, QuestionBlock, Standing};
use crate::handshake::{Handshake, HandshakeCoordinator};
use crate::messages::MessageFactory;
use crate::session::SessionContext;
use crate::transport::{Inbound, Transport};
use crate::Result;
use quizwire_types::{channel, Packet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One player in one game.
pub struct Client {
    config: ClientConfig,
    session: Arc<SessionContext>,
    transport: Arc<Transport>,
    game: GameSession,
    http: reqwest::Client,
    decryptor: TokenDecryptor,
}

impl Client {
    pub fn new(config: ClientConfig, pin: impl Into<String>, name: impl Into<String>) -> Self {
        let session = Arc::new(SessionContext::new(pin, name, config.host.clone()));
        let transport = Arc::new(Transport::new(session.clone(), &config));
        let game = GameSession::new(transport.clone());
        Self {
            config,
            session,
            transport,
            game,
            http: reqwest::Client::new(),
            decryptor: TokenDecryptor::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Reserve a session, decrypt its token, open the socket and run the handshake.
    pub async fn connect(&self) -> Result<Handshake> {
        let reservation =
            reserve_session(&self.http, &self.config.reserve_url, self.session.game_pin()).await?;
        self.connect_reserved(&reservation).await
    }

    pub async fn connect_reserved(&self, reservation: &Reservation) -> Result<Handshake> {
        let token = self
            .decryptor
            .decrypt(&reservation.session_token, &reservation.challenge)?;
        let url = format!(
            "{}/cometd/{}/{}",
            self.config.socket_url.trim_end_matches('/'),
            self.session.game_pin(),
            token
        );
        self.connect_url(&url).await
    }

    /// Open `url` and run the handshake. A failed handshake closes the socket again.
    pub async fn connect_url(&self, url: &str) -> Result<Handshake> {
        self.transport.connect(url).await?;
        let coordinator = HandshakeCoordinator::new(
            &self.transport,
            self.config.login_polls,
            self.config.phase_polls,
        );
        match coordinator.perform().await {
            Ok(handshake) => {
                info!(
                    pin = %self.session.game_pin(),
                    name = %self.session.player_name(),
                    "joined game"
                );
                Ok(handshake)
            }
            Err(err) => {
                warn!(%err, "handshake failed");
                self.transport.disconnect().await;
                Err(err)
            }
        }
    }

    /// Receive and dispatch until the connection closes.
    pub async fn listen(&self) {
        info!("listening for game events");
        while self.transport.is_open() {
            match self.transport.receive().await {
                Some(Inbound::Packet(packet)) => self.route(&packet).await,
                Some(Inbound::Empty) => debug!("empty frame"),
                None => {}
            }
        }
        info!("connection closed");
    }

    async fn route(&self, packet: &Packet) {
        match packet.channel.as_str() {
            channel::CONNECT => {
                let ack = MessageFactory::new(&self.session).acknowledgement();
                if let Err(err) = self.transport.send(ack).await {
                    warn!(?err, "failed to acknowledge heartbeat");
                }
            }
            channel::PLAYER => self.game.handle_packet(packet),
            channel::CONTROLLER => debug!(data = ?packet.data, "controller packet"),
            channel::STATUS => debug!(status = ?packet.status(), "status packet"),
            other => debug!(channel = other, "ignoring packet"),
        }
    }

    /// Tell the server we are leaving, then close the socket.
    pub async fn disconnect(&self) {
        if self.transport.is_open() {
            let packet = MessageFactory::new(&self.session).disconnect();
            if let Err(err) = self.transport.send(packet).await {
                debug!(?err, "disconnect packet not sent");
            }
        }
        self.transport.disconnect().await;
    }

    pub fn on_block_update<F, Fut>(&self, handler: F)
    where
        F: Fn(BlockContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.game.on_block_update(handler);
    }

    pub fn on_leaderboard<F, Fut>(&self, handler: F)
    where
        F: Fn(Standing) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.game.on_leaderboard(handler);
    }

    pub fn on_game_over<F, Fut>(&self, handler: F)
    where
        F: Fn(Standing) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.game.on_game_over(handler);
    }

    pub async fn join_team(&self, team_name: &str) -> Result<()> {
        let packet = MessageFactory::new(&self.session).join_team(team_name)?;
        self.transport.send(packet).await
    }

    pub async fn leave_team(&self) -> Result<()> {
        let packet = MessageFactory::new(&self.session).leave_team()?;
        self.transport.send(packet).await
    }

    pub async fn react(&self, reaction: &str) -> Result<()> {
        let packet = MessageFactory::new(&self.session).reaction(reaction)?;
        self.transport.send(packet).await
    }

    pub async fn change_nickname(&self, new_name: &str) -> Result<()> {
        let packet = MessageFactory::new(&self.session).nickname_change(new_name)?;
        self.transport.send(packet).await
    }

    pub fn score(&self) -> i64 {
        self.session.score()
    }

    pub fn rank(&self) -> i64 {
        self.session.rank()
    }

    pub fn block(&self, index: u32) -> Option<QuestionBlock> {
        self.game.block(index)
    }

    /// A context for answering a block outside of the update handler.
    pub fn context(&self, index: u32) -> Option<BlockContext> {
        self.game.context(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_key, xor_encrypt};
    use crate::game::{Answer, BlockStatus};
    use crate::mocks::{MockReservation, MockServer};
    use crate::{Error, HandshakeStage};
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CHALLENGE: &str = "decode.call(this, 'Xq3vPz'); function decode(message) { \
        var offset = ((12 + 30) * (2 + 5)); return message; }";

    fn config(server: &MockServer) -> ClientConfig {
        ClientConfig::default()
            .with_reserve_url(server.http_url())
            .with_socket_url(server.socket_url())
            .with_receive_timeout(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_poll_budgets(20, 1)
            .with_packet_log(None)
    }

    /// Server side of a handshake whose post-login phases simply time out.
    async fn script_handshake(server: &MockServer) {
        server.next_on(channel::HANDSHAKE).await;
        server.push(json!({"channel": "/meta/handshake", "successful": true, "clientId": "client-9"}));
        server.next_on(channel::CONNECT).await;
        server.push(json!({"channel": "/meta/connect", "successful": true, "ext": {"ack": 0}}));
        server.next_on(channel::CONTROLLER).await;
        server.push(json!({"channel": "/service/controller", "data": {"cid": 31337}}));
        let ready = server.next_on(channel::CONTROLLER).await;
        assert_eq!(ready.inner_type(), Some(16));
    }

    async fn joined(server: &MockServer) -> Arc<Client> {
        let client = Arc::new(Client::new(config(server), "482913", "Ada"));
        let connecting = {
            let client = client.clone();
            let url = server.url("482913", "tok");
            tokio::spawn(async move { client.connect_url(&url).await })
        };
        script_handshake(server).await;
        let handshake = connecting.await.unwrap().unwrap();
        assert_eq!(handshake.cid, "31337");
        client
    }

    #[tokio::test]
    async fn test_connect_decrypts_token_into_socket_url() {
        let server = MockServer::start().await;
        let key = generate_key("Xq3vPz", (12 + 30) * (2 + 5));
        server.set_reservation(MockReservation {
            status: StatusCode::OK,
            token: Some(xor_encrypt("tok/123", &key).unwrap()),
            body: json!({"challenge": CHALLENGE}),
        });

        let client = Arc::new(Client::new(config(&server), "482913", "Ada"));
        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        script_handshake(&server).await;
        let handshake = connecting.await.unwrap().unwrap();

        assert_eq!(handshake.client_id, "client-9");
        assert_eq!(
            server.connected_path().as_deref(),
            Some("/cometd/482913/tok%2F123")
        );
        assert!(client.is_connected());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_bad_challenge_aborts_before_socket() {
        let server = MockServer::start().await;
        server.set_reservation(MockReservation {
            status: StatusCode::OK,
            token: Some("dG9r".to_string()),
            body: json!({"challenge": "no message here"}),
        });

        let client = Client::new(config(&server), "482913", "Ada");
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Decryption { .. }));
        assert_eq!(server.connected_path(), None);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_transport() {
        let server = MockServer::start().await;
        let client = Arc::new(Client::new(config(&server), "482913", "Ada"));
        let connecting = {
            let client = client.clone();
            let url = server.url("482913", "tok");
            tokio::spawn(async move { client.connect_url(&url).await })
        };
        server.next_on(channel::HANDSHAKE).await;
        server.push(json!({"channel": "/meta/handshake", "successful": false}));

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake {
                stage: HandshakeStage::Handshake
            }
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_listen_routes_packets() {
        let server = MockServer::start().await;
        let client = joined(&server).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_block_update(move |ctx: BlockContext| {
            let tx = tx.clone();
            async move {
                if ctx.status() == BlockStatus::Started {
                    let _ = tx.send(ctx.answer(Answer::Choice(1)).await.is_ok());
                }
            }
        });
        let listening = {
            let client = client.clone();
            tokio::spawn(async move { client.listen().await })
        };

        // Heartbeat replies are acknowledged with the advanced ack.
        server.push(json!({"channel": "/meta/connect", "successful": true, "ext": {"ack": 9}}));
        let ack = server.next_on(channel::CONNECT).await;
        assert_eq!(ack.ack(), Some(10));

        let content = |value: Value| value.to_string();
        server.push(json!({"channel": "/service/player", "data": {"id": 1,
            "content": content(json!({"gameBlockIndex": 0, "type": "quiz", "numberOfChoices": 2}))}}));
        server.push(json!({"channel": "/service/player", "data": {"id": 2,
            "content": content(json!({"gameBlockIndex": 0}))}}));

        let answered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(answered);
        let answer = server.next_on(channel::CONTROLLER).await;
        let sent: Value = serde_json::from_str(answer.content().unwrap()).unwrap();
        assert_eq!(sent, json!({"type": "quiz", "choice": 1, "questionIndex": 0}));
        assert!(client.block(0).unwrap().answered);

        server.push(json!({"channel": "/service/player", "data": {"id": 8,
            "content": content(json!({"gameBlockIndex": 0, "totalScore": 870, "rank": 4}))}}));
        server.close();
        tokio::time::timeout(Duration::from_secs(5), listening)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((client.score(), client.rank()), (870, 4));
        assert_eq!(client.block(0).unwrap().status, BlockStatus::Ended);
    }

    #[tokio::test]
    async fn test_controller_operations_and_disconnect() {
        let server = MockServer::start().await;
        let client = joined(&server).await;

        client.join_team("Blue").await.unwrap();
        client.react("thumbsup").await.unwrap();
        client.change_nickname("Grace").await.unwrap();
        client.leave_team().await.unwrap();
        let mut kinds = Vec::new();
        for _ in 0..4 {
            let packet = server.next_on(channel::CONTROLLER).await;
            let content: Value = serde_json::from_str(packet.content().unwrap()).unwrap();
            kinds.push(match content.get("type") {
                Some(kind) => kind.as_str().unwrap().to_string(),
                None => content["newName"].as_str().unwrap().to_string(),
            });
        }
        assert_eq!(kinds, ["team_accept", "reaction", "Grace", "team_leave"]);

        client.disconnect().await;
        let bye = server.next_on(channel::DISCONNECT).await;
        assert_eq!(bye.client_id.as_deref(), Some("client-9"));
        assert!(!client.is_connected());
        client.disconnect().await;
        assert!(matches!(client.react("x").await, Err(Error::NotConnected)));
    }
}
