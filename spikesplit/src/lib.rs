pub mod data {
    pub mod store;
    pub mod projections;
    pub mod raw;
}

pub mod split {
    pub mod cache;
    pub mod projector;
    pub mod family;
    pub mod herding;
    pub mod maxchan_lda;
    pub mod pursuit;
    pub mod scheduler;
}

pub mod merge {
    pub mod proposer;
    pub mod oracle;
    pub mod scheduler;
}

pub mod labels;
pub mod io;
pub mod pipeline;
pub mod config;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SortError};
