pub use anyhow::{bail, ensure, format_err, Context as _, Result};
pub use approx::assert_abs_diff_eq;
pub use bbox::{prelude::*, Transform, HW, TLBR};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use indexmap::IndexSet;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Debug,
    iter,
    path::{Path, PathBuf},
};
pub use tch::{
    kind::{FLOAT_CPU, INT64_CPU},
    nn::{self, ModuleT as _, OptimizerConfig as _},
    vision, Device, IndexOp as _, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;

unzip_n::unzip_n!(pub 4);
