use slowlog_monitor::App;

#[tokio::main]
async fn main() {
    let app = match App::from_args(std::env::args()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = app.run().await {
        eprintln!("slowlog-monitor failed: {err:#}");
        std::process::exit(1);
    }
}
