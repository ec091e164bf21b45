mod common;
mod state;
