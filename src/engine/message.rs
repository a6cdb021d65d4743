//! Messages exchanged with a running scheduler.
//!
//! A scheduler is driven exclusively through two crossbeam channels: the
//! worker sends control messages in, the scheduler sends lifecycle and
//! setting notifications out. [`MessagePorts::connect`] creates both ends.

use crate::engine::property::PropertyMap;
use crate::error::AcqError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::str::FromStr;

/// Endpoint for lifecycle state requests and notifications
pub const LIFECYCLE_STATE_ENDPOINT: &str = "LifecycleState";

/// Endpoint for block setting requests and notifications
pub const SETTINGS_ENDPOINT: &str = "Settings";

/// Payload key holding the lifecycle state name
pub const STATE_KEY: &str = "state";

/// Message command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set,
    Get,
    Subscribe,
    Unsubscribe,
    Notify,
}

/// A control or notification message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: Command,
    /// Target (requests) or origin (notifications) block or scheduler name.
    /// Empty addresses every block.
    pub service_name: String,
    pub endpoint: String,
    pub data: Option<PropertyMap>,
    /// Identifies the client that sent a request
    pub client_request_id: String,
}

impl Message {
    pub fn new(command: Command, service_name: impl Into<String>, endpoint: &str) -> Self {
        Self {
            command,
            service_name: service_name.into(),
            endpoint: endpoint.to_string(),
            data: None,
            client_request_id: String::new(),
        }
    }

    pub fn with_data(mut self, data: PropertyMap) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client_request_id = client.into();
        self
    }

    /// Lifecycle state request addressed to `service_name`
    pub fn lifecycle_request(service_name: impl Into<String>, state: LifecycleState) -> Self {
        Self::new(Command::Set, service_name, LIFECYCLE_STATE_ENDPOINT)
            .with_data(crate::property_map! { STATE_KEY => state.as_str() })
    }

    /// Lifecycle state notification from `service_name`
    pub fn lifecycle_notification(service_name: impl Into<String>, state: LifecycleState) -> Self {
        Self::new(Command::Notify, service_name, LIFECYCLE_STATE_ENDPOINT)
            .with_data(crate::property_map! { STATE_KEY => state.as_str() })
    }

    /// Settings notification for block `block_name`
    pub fn settings_notification(block_name: impl Into<String>, settings: PropertyMap) -> Self {
        Self::new(Command::Notify, block_name, SETTINGS_ENDPOINT).with_data(settings)
    }
}

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Initialised,
    Running,
    RequestedStop,
    Stopped,
    Error,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Initialised => "INITIALISED",
            LifecycleState::Running => "RUNNING",
            LifecycleState::RequestedStop => "REQUESTED_STOP",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Error => "ERROR",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(LifecycleState::Idle),
            "INITIALISED" => Ok(LifecycleState::Initialised),
            "RUNNING" => Ok(LifecycleState::Running),
            "REQUESTED_STOP" => Ok(LifecycleState::RequestedStop),
            "STOPPED" => Ok(LifecycleState::Stopped),
            "ERROR" => Ok(LifecycleState::Error),
            other => Err(AcqError::Scheduler(format!(
                "Unknown lifecycle state '{}'",
                other
            ))),
        }
    }
}

/// Scheduler-side ends of the message channels
pub struct SchedulerPorts {
    /// Control messages from the worker
    pub msg_in: Receiver<Message>,
    /// Notifications to the worker
    pub msg_out: Sender<Message>,
}

/// Worker-side ends of the message channels
pub struct WorkerPorts {
    pub to_scheduler: Sender<Message>,
    pub from_scheduler: Receiver<Message>,
}

impl WorkerPorts {
    /// Send a message, reporting a closed channel as an error
    pub fn send(&self, message: Message) -> crate::error::Result<()> {
        self.to_scheduler
            .send(message)
            .map_err(|_| AcqError::Channel("scheduler input closed".to_string()))
    }

    /// Take every notification the scheduler has buffered so far
    pub fn drain(&self) -> Vec<Message> {
        self.from_scheduler.try_iter().collect()
    }
}

/// Factory for a connected pair of message ports
pub struct MessagePorts;

impl MessagePorts {
    pub fn connect() -> (SchedulerPorts, WorkerPorts) {
        let (to_scheduler, msg_in) = unbounded();
        let (msg_out, from_scheduler) = unbounded();
        (
            SchedulerPorts { msg_in, msg_out },
            WorkerPorts {
                to_scheduler,
                from_scheduler,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::property::get_property;

    #[test]
    fn test_lifecycle_state_round_trip_names() {
        for state in [
            LifecycleState::Idle,
            LifecycleState::Initialised,
            LifecycleState::Running,
            LifecycleState::RequestedStop,
            LifecycleState::Stopped,
            LifecycleState::Error,
        ] {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
        assert!("stopped".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_lifecycle_request_payload() {
        let msg = Message::lifecycle_request("sched", LifecycleState::RequestedStop);
        assert_eq!(msg.command, Command::Set);
        assert_eq!(msg.endpoint, LIFECYCLE_STATE_ENDPOINT);
        let data = msg.data.unwrap();
        assert_eq!(
            get_property::<String>(&data, STATE_KEY).unwrap().as_deref(),
            Some("REQUESTED_STOP")
        );
    }

    #[test]
    fn test_ports_connect() {
        let (sched, worker) = MessagePorts::connect();
        worker
            .send(Message::new(Command::Subscribe, "", SETTINGS_ENDPOINT))
            .unwrap();
        assert_eq!(sched.msg_in.try_recv().unwrap().command, Command::Subscribe);

        sched
            .msg_out
            .send(Message::lifecycle_notification("sched", LifecycleState::Stopped))
            .unwrap();
        let drained = worker.drain();
        assert_eq!(drained.len(), 1);
        assert!(worker.drain().is_empty());
    }

    #[test]
    fn test_send_after_scheduler_dropped() {
        let (sched, worker) = MessagePorts::connect();
        drop(sched);
        assert!(worker
            .send(Message::lifecycle_request("sched", LifecycleState::RequestedStop))
            .is_err());
    }
}
