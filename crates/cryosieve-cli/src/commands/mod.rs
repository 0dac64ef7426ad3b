pub mod inspect;
pub mod sieve;
