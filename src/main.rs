#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = assignment_grader::run_worker().await {
        eprintln!("assignment-grader fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
