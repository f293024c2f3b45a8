//! Plugins shipped with Warden.

pub mod metadata;
pub mod virtual_ip;

pub use metadata::MetadataPlugin;
pub use virtual_ip::VirtualIpPlugin;

use crate::plugin::Plugin;
use crate::{LeaderError, LeaderResult};

/// Names accepted by [`builtin`].
pub const BUILTIN_PLUGINS: &[&str] = &[metadata::NAME, virtual_ip::NAME];

/// Instantiates the built-in plugins named in `names`, in order.
pub fn builtin<S: AsRef<str>>(names: &[S]) -> LeaderResult<Vec<Box<dyn Plugin>>> {
    names
        .iter()
        .map(|name| match name.as_ref() {
            metadata::NAME => Ok(Box::new(MetadataPlugin::new()) as Box<dyn Plugin>),
            virtual_ip::NAME => Ok(Box::new(VirtualIpPlugin::new()) as Box<dyn Plugin>),
            other => Err(LeaderError::config(format!("unknown plugin '{}'", other))),
        })
        .collect()
}
