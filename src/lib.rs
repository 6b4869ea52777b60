//! This crate provides a pool of long-running application worker
//! processes, the way a front-end HTTP server wants one: requests ask
//! the pool for a *session* on a named application, forward the request
//! over it, and release it when done.
//!
//! The pool maintains a fleet of workers per application (a *group*),
//! spawns workers on demand through an external spawn helper, routes
//! each session to the least-loaded worker, enforces per-group and
//! global capacity limits, and detaches, replaces, restarts and
//! gracefully retires workers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use procpool::{Options, Pool, RandomGenerator, SpawnManagerConfig, SpawnManagerFactory};
//!
//! let random = Arc::new(RandomGenerator::new());
//! let factory = Arc::new(SpawnManagerFactory::new(
//!     SpawnManagerConfig::new("/opt/app/spawn-server"),
//!     random.clone(),
//! ));
//! let pool = Pool::builder(factory).max(6).build();
//!
//! let options = Options::new("/srv/myapp").min_processes(1).max_processes(4);
//! let mut session = pool.get_sync(&options, Duration::from_secs(30))?;
//! session.initiate()?;
//! // ... forward the request over session.stream() ...
//! session.close();
//! # Ok::<(), procpool::PoolError>(())
//! ```
//!
//! Workers can ask for an out-of-band maintenance window; the pool
//! takes them off the rotation, sends them an `OOBW` request once they
//! are idle, and puts them back afterwards.
//!
//! Restarts are triggered through [`Pool::restart`] or by touching
//! `tmp/restart.txt` (one-shot) or `always_restart.txt` under the
//! application root.

mod channel;
mod error;
mod group;
mod options;
mod pool;
mod pqueue;
mod process;
mod random;
mod session;
mod spawn;
mod supergroup;
mod threads;

#[cfg(feature = "test-support")]
pub mod testsupport;

pub use crate::channel::MessageChannel;
pub use crate::error::PoolError;
pub use crate::group::{DisableCallback, DisableResult};
pub use crate::options::{AppType, Options, SpawnMethod};
pub use crate::pool::{
    GetCallback, GroupSnapshot, Pool, PoolBuilder, PoolSnapshot, ProcessSnapshot,
    SuperGroupSnapshot,
};
pub use crate::process::{EnableState, Process, Socket};
pub use crate::random::RandomGenerator;
pub use crate::session::Session;
pub use crate::spawn::{
    SpawnManager, SpawnManagerConfig, SpawnManagerFactory, Spawner, SpawnerFactory,
};
