// algorithm module
pub mod algorithm {
    pub mod utility;
    pub mod pca;
    pub mod lda;
    pub mod isocut;
    pub mod hdbscan;
}

// waveform module
pub mod waveform {
    pub mod basis;
    pub mod template;
    pub mod residual;
}

pub mod error;

pub use error::{CoreError, Result};
