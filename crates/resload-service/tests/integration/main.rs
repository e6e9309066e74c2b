mod lifecycle;
mod loader;
mod utils;
