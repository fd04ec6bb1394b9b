pub(crate) mod bootstrap;
pub(crate) mod loop_runner;
pub(crate) mod simulation;
pub(crate) mod world;

#[cfg(test)]
mod tests;
