#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::wildcard_imports)]

pub mod cache;
pub mod recursive;

pub use self::cache::SharedCache;
pub use self::recursive::{ResolutionError, Resolver, RECURSION_LIMIT};
