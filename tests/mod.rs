mod backoff_tests;
mod codec_tests;
mod common;
mod publisher_tests;
mod retry_tests;
