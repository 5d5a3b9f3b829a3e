//! Supervised pool of long-lived interpreter worker processes.
//!
//! A [`Pool`] materializes a [`ScriptBundle`] into a temporary workspace and
//! starts one process per worker, each running the bundle's entry script.
//! Calls are framed over a pair of pipes on descriptors 3 and 4, leaving the
//! worker's standard streams free for logging.
//!
//! ```no_run
//! use scriptpool::{Pool, PoolConfig, ScriptBundle};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> scriptpool::Result<()> {
//! let bundle = ScriptBundle::new()
//!     .with_python_adapter()?
//!     .with_file("main.py", "from scriptpool_adapter import serve\nserve({})\n")?;
//! let pool = Pool::create(&bundle, PoolConfig::new("/usr/bin/python3", "main.py", 4)).await?;
//!
//! let sum: Value = pool.call("add", &json!({"a": 5, "b": 6})).await?;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("scriptpool requires a Unix platform (inherited pipe descriptors)");

pub mod array;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod pool;
pub mod serve;
pub mod worker;
pub mod workspace;

pub use array::{Array1D, Array2D, Float32Array, Float32Array2D, Float64Array, Float64Array2D};
pub use config::{BridgeConfig, PoolConfig, WorkerConfig};
pub use error::{ErrorCategory, PoolError, Result};
pub use pool::Pool;
pub use serve::WorkerRuntime;
pub use worker::{Worker, WorkerState};
pub use workspace::{ScriptBundle, PYTHON_ADAPTER};
