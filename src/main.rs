#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = essay_exams::run().await {
        eprintln!("essay-exams fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
