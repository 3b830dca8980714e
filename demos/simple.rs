//! Minimal end-to-end walkthrough of the session/consumer/producer API
//! against a logging stand-in transport. A real [`Transport`] would marshal
//! these commands as OpenWire frames onto a socket; this one just logs what
//! it was asked to send, so the demo runs without a broker.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use amq_client::{
    prelude::*,
    producer::SendOptions,
    state::ConnectionStateTracker,
    timer::TimerService,
    transport::Dispatcher,
};
use tracing::info;

struct LoggingTransport {
    dispatchers: Mutex<Vec<(ConsumerId, Arc<dyn Dispatcher>)>>,
}

impl LoggingTransport {
    fn new() -> Arc<Self> { Arc::new(Self { dispatchers: Mutex::new(Vec::new()) }) }
}

impl Transport for LoggingTransport {
    fn oneway(&self, command: Command) -> Result<()> {
        info!(?command, "-> broker (oneway)");
        Ok(())
    }

    fn sync_request(&self, command: Command, _timeout: Option<Duration>) -> Result<Command> {
        info!(?command, "-> broker (sync)");
        Ok(Command::Response)
    }

    fn add_dispatcher(&self, consumer_id: ConsumerId, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers.lock().unwrap().push((consumer_id, dispatcher));
    }

    fn remove_dispatcher(&self, consumer_id: &ConsumerId) {
        self.dispatchers.lock().unwrap().retain(|(id, _)| id != consumer_id);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let connection_id = ConnectionId::from("demo-connection");
    let transport = LoggingTransport::new();
    let state = Arc::new(ConnectionStateTracker::new(ConnectionInfo {
        connection_id: connection_id.clone(),
        client_id: Some("demo-client".into()),
        user_name: None,
    }));
    let timer = TimerService::start();

    let session = Session::new(
        SessionId::new(connection_id, 1),
        transport.clone(),
        state,
        timer,
        false,
        false,
    )?;

    let consumer = session.create_consumer(
        Destination::queue("demo.queue"),
        None,
        None,
        100,
        false,
        false,
        AcknowledgementMode::AutoAcknowledgeEach,
    )?;
    consumer.set_message_listener(|delivered: amq_client::consumer::DeliveredMessage| {
        info!(body_len = delivered.message.body.len(), "received a message");
    })?;

    let producer = session.create_producer(Some(Destination::queue("demo.queue")), None)?;
    producer.send(b"hello from amq-client".to_vec(), SendOptions::default())?;

    session.close()?;
    Ok(())
}
