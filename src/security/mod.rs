pub mod audit;
pub mod password;
pub mod session;

pub use audit::{AuditEntry, AuditService, ClientInfo};
pub use password::{validate_password_strength, PasswordService, PasswordStrength};
pub use session::{IssuedSession, SessionService, ValidatedSession};
