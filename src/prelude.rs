// Internal logging facade: `debug!`, `info!`, `warn!`, `error!` taking a
// `Logger` as their first argument.

#[allow(unused_imports)]
pub(crate) use crate::observability::{
    log_debug as debug, log_error as error, log_info as info, log_warn as warn,
};
