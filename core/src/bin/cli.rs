/// Command-line client for a chat backend
fn main() -> anyhow::Result<()> {
    chatline_core::cli_app::run(std::env::args().collect())
}
