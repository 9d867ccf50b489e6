pub mod command_runner;
pub mod file_read;
pub mod tts;
pub mod web_search;

pub use command_runner::CommandRunnerTool;
pub use file_read::FileReadTool;
pub use tts::TtsTool;
pub use web_search::WebSearchTool;
