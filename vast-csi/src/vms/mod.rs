pub mod model;
pub mod session;
pub mod test_session;

pub use model::{Page, Quota, Snapshot, View, ViewPolicy, Vip, VipPool};
pub use session::{RestSession, VmsSession};
pub use test_session::TestSession;
