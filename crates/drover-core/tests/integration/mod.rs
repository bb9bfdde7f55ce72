mod cache_tests;
mod common;
mod drover_tests;
mod pool_tests;
mod scheduler_tests;
