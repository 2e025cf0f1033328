//! Task context for IPC
//!
//! Based on Mach4 kern/task.h
//!
//! Only the parts of a task that message transfer touches are modelled:
//! - IPC space (itk_space) for port name translation
//! - Address map for out-of-line memory
//! - Security and audit tokens stamped into the trailers of messages the
//!   task sends

use std::fmt;
use std::sync::Arc;

use crate::config::IpcConfig;
use crate::ipc::message::{AuditToken, SecurityToken};
use crate::ipc::space::{IpcSpace, SimpleSpace};
use crate::types::TaskId;
use crate::vm::{SimpleMap, VmMap};

/// The sending or receiving side of a `mach_msg`
#[derive(Clone)]
pub struct IpcTask {
    /// Task identifier
    pub id: TaskId,

    /// Port name space
    pub space: Arc<dyn IpcSpace>,

    /// Address map for out-of-line regions
    pub map: Arc<dyn VmMap>,

    /// Sender identity reported in trailers
    pub sec_token: SecurityToken,
    pub audit_token: AuditToken,

    pub config: IpcConfig,
}

impl IpcTask {
    /// Task over caller-supplied collaborators
    pub fn new(space: Arc<dyn IpcSpace>, map: Arc<dyn VmMap>, config: IpcConfig) -> Self {
        let id = TaskId::new();
        Self {
            id,
            space,
            map,
            sec_token: SecurityToken([id.0 as u32, 0]),
            audit_token: AuditToken::default(),
            config,
        }
    }

    /// Task with a fresh [`SimpleSpace`] and [`SimpleMap`]
    ///
    /// Returns the concrete collaborators alongside so callers can set up
    /// names and regions directly.
    pub fn simple() -> (Self, Arc<SimpleSpace>, Arc<SimpleMap>) {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> (Self, Arc<SimpleSpace>, Arc<SimpleMap>) {
        let space = SimpleSpace::with_config(config);
        let map = Arc::new(SimpleMap::with_region_limit(config.region_limit));
        let task = Self::new(space.clone(), map.clone(), config);
        (task, space, map)
    }

    pub fn with_tokens(mut self, sec_token: SecurityToken, audit_token: AuditToken) -> Self {
        self.sec_token = sec_token;
        self.audit_token = audit_token;
        self
    }
}

impl fmt::Debug for IpcTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcTask")
            .field("id", &self.id)
            .field("sec_token", &self.sec_token)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_task_shares_collaborators() {
        let (task, space, _map) = IpcTask::simple();
        let name = space.allocate_receive().unwrap();
        assert!(task.space.lookup_receive(name).is_ok());
        assert_eq!(task.sec_token.0[0], task.id.0 as u32);
    }

    #[test]
    fn test_tokens_override() {
        let (task, _, _) = IpcTask::simple();
        let task = task.with_tokens(SecurityToken([7, 8]), AuditToken([1; 8]));
        assert_eq!(task.sec_token, SecurityToken([7, 8]));
        assert_eq!(task.audit_token.0[3], 1);
    }
}
