pub mod cache;
pub mod cli;
pub mod config;
pub mod policy;
pub mod server;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod types;

pub use cache::{Ban, BanError, BanList, BanProto, Cache, Lookup, ObjCore, ObjHead, Timers};
pub use config::{Params, SharedParams};
pub use policy::{DefaultPolicy, Policy, Req};
pub use server::Server;
pub use stats::{Counters, Global};
pub use storage::{MemStevedore, ObjAttr, ObjEvent, Stevedore};
pub use transport::{Session, SinkTransport, Transport, TransportRegistry};
pub use types::{real_now, Digest, DigestCtx, Dur, Real, DIGEST_LEN};
