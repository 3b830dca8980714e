use std::collections::HashMap;

use crate::{
    command::{ConsumerInfo, ProducerInfo},
    ids::{ConsumerId, ProducerId},
};

/// Everything needed to re-register one consumer at the broker after a
/// reconnect.
#[derive(Debug, Clone)]
pub struct ConsumerState {
    pub info: ConsumerInfo,
}

/// Everything needed to re-register one producer at the broker after a
/// reconnect.
#[derive(Debug, Clone)]
pub struct ProducerState {
    pub info: ProducerInfo,
}

/// One session's children, tracked for replay.
#[derive(Debug, Default)]
pub struct SessionState {
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    shutdown:  bool,
}

impl SessionState {
    pub fn new() -> Self { Self::default() }

    pub fn add_producer(&mut self, info: ProducerInfo) -> crate::Result<()> {
        if self.shutdown {
            return Err(crate::Error::ObjectClosed("session state disposed".into()));
        }
        self.producers.insert(info.producer_id.clone(), ProducerState { info });
        Ok(())
    }

    pub fn remove_producer(&mut self, id: &ProducerId) -> Option<ProducerState> {
        self.producers.remove(id)
    }

    pub fn add_consumer(&mut self, info: ConsumerInfo) -> crate::Result<()> {
        if self.shutdown {
            return Err(crate::Error::ObjectClosed("session state disposed".into()));
        }
        self.consumers.insert(info.consumer_id.clone(), ConsumerState { info });
        Ok(())
    }

    pub fn remove_consumer(&mut self, id: &ConsumerId) -> Option<ConsumerState> {
        self.consumers.remove(id)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerState> { self.consumers.values() }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerState> { self.producers.values() }

    pub fn shutdown(&mut self) {
        self.shutdown = true;
        self.producers.clear();
        self.consumers.clear();
    }

    pub fn is_shutdown(&self) -> bool { self.shutdown }
}
