pub mod detect;
pub mod install;

pub use detect::{detect, JavaInfo};
pub use install::install_jdk;
