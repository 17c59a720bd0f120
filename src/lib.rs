#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod assets;
pub mod config;
pub mod credentials;
pub mod grid;
mod increment;
pub mod logging;
pub mod runner;
pub mod signature;
pub mod signer;
pub mod stamp;
pub mod verify;
pub mod viewer;

pub use increment::Annotation;
pub use runner::{RunReport, SignedDocument, SigningService, TestRunner, ViewOutcome, Viewer};

/// Collects an iterator into an array of exactly `N` elements, or `None` if
/// the count is different.
struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}
