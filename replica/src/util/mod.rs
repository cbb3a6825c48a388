mod backoff;

pub use backoff::ExponentialBackoff;
