//! Barrier hierarchy, persistence, realm/user/session services, and
//! process wiring for a multi-tenant KMS (spec §4).

pub mod app;
pub mod barrier;
pub mod realm;
pub mod repository;
pub mod session;
pub mod user;

pub use app::{ApplicationCore, Config, UnsealModeConfig};
pub use barrier::{BarrierService, BarrierStatus};
pub use realm::{Product, Realm, RealmService, RealmStatus, TenantContext};
pub use repository::{BarrierRepository, KeyRow, Tier};
pub use session::{SessionClaims, SessionKind, SessionService};
pub use user::{UserModel, UserRepository, UserService};
