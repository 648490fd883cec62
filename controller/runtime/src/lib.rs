pub use tollgate_controller_k8s_api as k8s;

mod admission;
mod api;
mod args;
mod gateway;
mod ledger;
mod metrics;
mod reconcile;
mod server;
mod workload;

pub use self::args::Args;
