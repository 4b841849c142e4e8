//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{DateTime, Local};
pub use futures::{
    future::FutureExt,
    stream::{self, StreamExt, TryStreamExt},
};
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use rand::seq::SliceRandom;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::BTreeMap,
    future::Future,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};
pub use tracing::{debug, info, info_span, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
