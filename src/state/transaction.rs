use crate::command::Command;

/// Replay log and two-phase-commit bookkeeping for one open transaction.
#[derive(Debug, Default)]
pub struct TransactionState {
    commands: Vec<Command>,
    prepared: bool,
    prepared_vote: Option<i32>,
    shutdown: bool,
}

impl TransactionState {
    pub fn new() -> Self { Self::default() }

    pub fn add_command(&mut self, command: Command) -> crate::Result<()> {
        if self.shutdown {
            return Err(crate::Error::ObjectClosed("transaction state disposed".into()));
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn commands(&self) -> &[Command] { &self.commands }

    pub fn set_prepared(&mut self, vote: i32) {
        self.prepared = true;
        self.prepared_vote = Some(vote);
    }

    pub fn prepared(&self) -> bool { self.prepared }

    pub fn prepared_vote(&self) -> Option<i32> { self.prepared_vote }

    pub fn shutdown(&mut self) {
        self.shutdown = true;
        self.commands.clear();
    }

    pub fn is_shutdown(&self) -> bool { self.shutdown }
}
