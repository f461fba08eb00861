//! CoEdit editing engine.
//!
//! The pieces every replica shares, with no I/O and no locking:
//!
//! - [`Operation`] — atomic insert/delete edit with position and timestamp
//! - [`diff`] — converts an old/new text pair into a minimal operation list
//! - [`Replica`] — content plus applied-operation history, merged with the
//!   revert–sort–reapply algorithm
//!
//! The authoritative store on the server and every live editor buffer run
//! the same [`Replica::merge`], which is what keeps them convergent: the
//! result depends only on the *set* of operations seen, not their arrival
//! order (timestamps are the total order key).

mod diff;
mod operation;
mod replica;

pub use diff::diff;
pub use operation::{timestamp_now, OpKind, Operation};
pub use replica::Replica;
