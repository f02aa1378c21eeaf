pub mod backbone;
pub mod detector;
pub mod head;
pub mod neck;
pub mod repvgg;
