//! Bounded FIFO of command records from application tasks to the agent

use super::command::Command;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// Why a send failed. The record is handed back so the caller can release it.
#[derive(Debug)]
pub enum QueueSendError {
    Full(Command),
    Closed(Command),
}

impl QueueSendError {
    pub fn into_command(self) -> Command {
        match self {
            QueueSendError::Full(command) | QueueSendError::Closed(command) => command,
        }
    }
}

/// Producer side, cloned into every [`AgentHandle`](super::AgentHandle)
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
}

/// Consumer side, owned by the agent
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
}

/// Outcome of a receive attempt
#[derive(Debug)]
pub enum Received {
    Command(Command),
    Empty,
    /// Every sender is gone and the queue is drained.
    Closed,
}

pub fn command_queue(depth: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (CommandSender { tx }, CommandReceiver { rx })
}

impl CommandSender {
    /// Enqueue, waiting up to `block` for space. A zero `block` never waits.
    pub async fn send(&self, command: Command, block: Duration) -> Result<(), QueueSendError> {
        if block.is_zero() {
            return self.tx.try_send(command).map_err(|e| match e {
                TrySendError::Full(command) => QueueSendError::Full(command),
                TrySendError::Closed(command) => QueueSendError::Closed(command),
            });
        }
        self.tx.send_timeout(command, block).await.map_err(|e| match e {
            SendTimeoutError::Timeout(command) => QueueSendError::Full(command),
            SendTimeoutError::Closed(command) => QueueSendError::Closed(command),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl CommandReceiver {
    /// Dequeue, waiting up to `block` for a command. A zero `block` never waits.
    pub async fn recv(&mut self, block: Duration) -> Received {
        if block.is_zero() {
            return self.try_recv();
        }
        match tokio::time::timeout(block, self.rx.recv()).await {
            Ok(Some(command)) => Received::Command(command),
            Ok(None) => Received::Closed,
            Err(_) => Received::Empty,
        }
    }

    pub fn try_recv(&mut self) -> Received {
        match self.rx.try_recv() {
            Ok(command) => Received::Command(command),
            Err(mpsc::error::TryRecvError::Empty) => Received::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Stop accepting new commands. Already queued commands can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
