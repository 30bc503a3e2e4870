//! FVP Chain Contracts Library
//! Transaction input shapes, redeemers, datums and the client seams the
//! distribution engine consumes.

pub mod client;
pub mod gateway;
pub mod oracle;
pub mod testing;
pub mod types;

pub use client::*;
pub use gateway::*;
pub use oracle::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_tag_is_stable() {
        let a = types::datum_tag("ab01", 0);
        let b = types::datum_tag("ab01", 0);
        let c = types::datum_tag("ab01", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
