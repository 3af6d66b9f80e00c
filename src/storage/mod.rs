pub mod chain;
pub mod ctx;
pub mod diagnostic;
pub mod iter;
pub mod scn;
pub mod unit;

pub use chain::{READ_ALL, ScanRecord, VersionChain, VersionView};
pub use ctx::{TxnCtx, TxnState, Writer, WriterKind};
pub use diagnostic::{NodeInfo, NodeState};
pub use iter::{Entries, Iter};
pub use scn::Scn;
pub use unit::{SingleUnit, StateUnit};
