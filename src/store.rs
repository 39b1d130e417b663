pub(crate) mod jobs;
pub(crate) mod keys;
pub(crate) mod kv;
pub(crate) mod ledger;
pub(crate) mod memory;
pub(crate) mod models;
pub(crate) mod rest;

pub(crate) use jobs::JobStore;
pub(crate) use kv::KvStore;
pub(crate) use ledger::SeenLedger;
