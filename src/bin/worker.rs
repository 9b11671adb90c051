#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = essay_exams::run_worker().await {
        eprintln!("essay-exams-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
