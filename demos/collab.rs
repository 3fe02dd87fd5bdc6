use dc_cache::test::simulation::sim_app::CollabApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    CollabApp::run().await.inspect_err(|err| {
        eprintln!("Simulation errored out: {err:?}");
    })
}
