// Risk management module
pub mod capital;

pub use capital::{
    CapitalAllocator, CapitalError, CapitalLedger, CapitalLimits, CapitalRejection, Reservation,
};
