pub use anyhow::{anyhow, bail, Context as _, Result as Fallible};

pub use log::{debug, error, info, trace, warn};
pub use serde_derive::{Deserialize, Serialize};
