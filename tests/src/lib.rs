//! Scenario tests exercising the core through its public API.

#[cfg(test)]
mod unit;
