use std::{path::Path, sync::Arc, time::Duration};

use rama::{
    Layer,
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    http::{
        HeaderValue,
        layer::{required_header::AddRequiredResponseHeadersLayer, trace::TraceLayer},
        server::HttpServer,
    },
    layer::TimeoutLayer,
    net::address::SocketAddress,
    rt::Executor,
    tcp::server::TcpListener,
    telemetry::tracing,
};

use metricsim_lib::{control::ControlService, utils::env::server_identifier};

use crate::Args;

/// Serves the control surface and the metrics endpoint
/// until the guard signals shutdown.
pub async fn run_control_server(
    args: Args,
    guard: ShutdownGuard,
    svc: ControlService,
) -> Result<(), BoxError> {
    let http_svc = (
        TraceLayer::new_for_http(),
        AddRequiredResponseHeadersLayer::new()
            .with_server_header_value(HeaderValue::from_static(server_identifier())),
    )
        .into_layer(svc);

    let exec = Executor::graceful(guard);
    let http_server = HttpServer::auto(exec.clone()).service(Arc::new(http_svc));
    let tcp_svc = TimeoutLayer::new(Duration::from_secs(60)).into_layer(http_server);

    let tcp_listener = TcpListener::bind(args.bind, exec)
        .await
        .context("bind control http server")?;

    let control_addr = tcp_listener
        .local_addr()
        .context("get bound address for control http server")?;

    tracing::info!("control http server bound to: {control_addr}");
    if let Some(dir) = args.data.as_deref() {
        write_server_socket_address_as_file(dir, "control", control_addr.into()).await?;
    }

    tcp_listener.serve(tcp_svc).await;

    Ok(())
}

async fn write_server_socket_address_as_file(
    dir: &Path,
    name: &str,
    addr: SocketAddress,
) -> Result<(), BoxError> {
    let path = dir.join(format!("{name}.addr.txt"));
    tokio::fs::write(&path, addr.to_string())
        .await
        .context("write server's socket address to file")
        .context_field("address", addr)
        .with_context_debug_field("path", || path.to_owned())
}
