//! Optimizers and learning rate schedules for the student network

mod optimizer;
mod scheduler;
mod sgd;

pub use optimizer::Optimizer;
pub use scheduler::MultiStepLR;
pub use sgd::SGD;
