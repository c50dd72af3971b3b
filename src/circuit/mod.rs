mod qps;

pub use qps::QpsLimiter;
