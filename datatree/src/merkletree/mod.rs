//! The Merkle side of the store: twigs, their on-disk snapshots, the upper
//! trees, proofs, recovery and consistency checks.

pub mod check;
pub mod helpers;
pub mod proof;
pub mod recover;
pub mod tree;
pub mod twig;
pub mod twigfile;

pub use proof::ProofPath;
pub use tree::{NodePos, Tree, UpperTree};
pub use twig::{ActiveBits, Twig};
pub use twigfile::TwigFile;
