pub mod config;
pub mod error;
pub mod util;
pub mod peer;
pub mod transport;
pub mod cm;
pub mod rdm;
pub mod test_util;
