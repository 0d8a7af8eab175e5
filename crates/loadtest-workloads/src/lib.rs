//! Builtin workloads for pgstress.
//!
//! - `connection` - pool checkout plus `SELECT 1`
//! - `simple` - select/update/insert/delete mix over `pgstress_simple`
//!
//! The binary passes [`builtins`] to the workload factory; the engine itself
//! does not know about these workloads.

pub mod connection;
pub mod simple;

use loadtest_engine::BuiltinWorkload;

pub use connection::ConnectionWorkload;
pub use simple::SimpleWorkload;

const BUILTINS: &[BuiltinWorkload] = &[
    BuiltinWorkload {
        name: connection::NAME,
        description: "Check out a connection and run SELECT 1",
        create: ConnectionWorkload::create,
    },
    BuiltinWorkload {
        name: simple::NAME,
        description: "CRUD mix (50% select, 30% update, 10% insert, 10% delete)",
        create: SimpleWorkload::create,
    },
];

/// Every builtin workload.
pub fn builtins() -> &'static [BuiltinWorkload] {
    BUILTINS
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadtest_engine::{RunConfig, WorkloadFactory};

    #[test]
    fn test_builtins_register_without_collisions() {
        let factory = WorkloadFactory::new(&RunConfig::new("simple", 1, 1), builtins()).unwrap();
        assert_eq!(factory.registry().names(), vec!["connection", "simple"]);
        assert!(factory.get("connection").is_ok());
        assert!(factory.get("simple").is_ok());
    }
}
