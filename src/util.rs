pub(crate) mod ident;
pub(crate) mod retry;
pub(crate) mod time;
