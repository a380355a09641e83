mod support;

mod postgres_tests;
mod smtp_tests;
