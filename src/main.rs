fn main() -> anyhow::Result<()> {
    ajaxdispatch::cli::run_cli()
}
