pub mod atlas;
pub mod geometry;
pub mod loop_closing;
pub mod optimizer;
pub mod system;
pub mod vocabulary;

#[cfg(test)]
mod test_support;
