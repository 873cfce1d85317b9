pub(crate) mod client;
pub(crate) mod events;
#[cfg(test)]
pub(crate) mod fake;
pub(crate) mod gitops_config;
pub(crate) mod ownership;
pub(crate) mod renderer;
