mod id;

pub use id::{AuditRecordId, PolicyId, SecurityAlertId, SessionId, UserId};
