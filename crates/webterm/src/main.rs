//! Multi-session terminal server and CLI.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use webterm_client::{ConnectionHub, ProxyEvent, ProxyOptions, SessionProxy};

#[derive(clap::Parser)]
#[command(name = "webterm", about = "Shells on PTYs, served over WebSocket")]
struct Args {
    /// Enable debug logging to ~/.webterm/logs/
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (defaults to ~/.config/webterm/config.toml).
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the server (default when no command given).
    Serve {
        /// Address to listen on.
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on.
        #[arg(short, long)]
        port: Option<u16>,
        /// HTML page to serve at `/` instead of the built-in one.
        #[arg(long)]
        index: Option<std::path::PathBuf>,
    },
    /// Open a session in this terminal.
    Open {
        /// Server WebSocket URL (defaults to the configured one).
        url: Option<String>,
    },
}

/// Terminal size as (cols, rows), if stdin is a terminal.
fn get_window_size() -> Option<(u16, u16)> {
    let mut ws: nix::pty::Winsize = unsafe { std::mem::zeroed() };
    let result =
        unsafe { nix::libc::ioctl(nix::libc::STDIN_FILENO, nix::libc::TIOCGWINSZ, &mut ws) };
    (result == 0 && ws.ws_col > 0 && ws.ws_row > 0).then_some((ws.ws_col, ws.ws_row))
}

fn setup_terminal(fd: BorrowedFd<'_>) -> nix::Result<nix::sys::termios::Termios> {
    let orig = nix::sys::termios::tcgetattr(fd)?;
    let mut raw = orig.clone();
    nix::sys::termios::cfmakeraw(&mut raw);
    nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, &raw)?;
    Ok(orig)
}

fn restore_terminal(fd: BorrowedFd<'_>, termios: &nix::sys::termios::Termios) {
    let _ = nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, termios);
}

async fn run_open(config: webterm_config::Config, url: Option<String>) -> eyre::Result<()> {
    let url = url.unwrap_or_else(|| config.client.url.clone());
    let options = ProxyOptions::from_config(&config.client);
    let close_key = webterm_config::Keybind::parse(&config.keybinds.close)
        .wrap_err("failed to parse close keybind")?;

    let (cols, rows) = get_window_size().unwrap_or((
        config.sessions.cols.max(1),
        config.sessions.rows.max(1),
    ));
    let hub = Arc::new(ConnectionHub::new(url.clone()));
    let mut proxy = SessionProxy::open(
        hub,
        options,
        u32::from(cols) * options.cell_width,
        u32::from(rows) * options.cell_height,
    )
    .await
    .wrap_err_with(|| format!("failed to open a session on {url}"))?;
    // The local terminal already knows its grid
    proxy.resize_grid(cols, rows)?;

    let session = proxy
        .session_id()
        .map_or_else(|| "?".to_string(), |id| id.to_string());
    eprintln!(
        "\x1b[2m[session {session} on {url}, {} to close]\x1b[0m",
        config.keybinds.close
    );

    let stdin_fd = unsafe { BorrowedFd::borrow_raw(nix::libc::STDIN_FILENO) };
    let orig_termios = setup_terminal(stdin_fd).ok();

    let mut winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        .wrap_err("failed to listen for SIGWINCH")?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stdin_buf = vec![0u8; 4096];

    let exit_code = loop {
        tokio::select! {
            result = stdin.read(&mut stdin_buf) => {
                match result {
                    Ok(0) => break 0,
                    Ok(n) => {
                        let input = &stdin_buf[..n];
                        let (passthrough, close) = match close_key.find(input) {
                            Some(pos) => (&input[..pos], true),
                            None => (input, false),
                        };
                        if !passthrough.is_empty()
                            && let Err(e) = proxy.send_input(passthrough)
                        {
                            tracing::debug!("send_input error: {e}");
                            break 1;
                        }
                        if close {
                            let closed = tokio::time::timeout(
                                Duration::from_secs(2),
                                proxy.close_and_wait(),
                            )
                            .await;
                            if !matches!(closed, Ok(Ok(()))) {
                                tracing::debug!("server did not confirm destroy");
                            }
                            break 0;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("stdin read error: {e}");
                        break 0;
                    }
                }
            }
            event = proxy.next_event() => {
                match event {
                    Some(ProxyEvent::Output(data)) => {
                        if stdout.write_all(&data).await.is_err() {
                            break 1;
                        }
                        let _ = stdout.flush().await;
                    }
                    Some(ProxyEvent::Title(title)) => {
                        // OSC 0: set window title
                        let _ = stdout.write_all(format!("\x1b]0;{title}\x07").as_bytes()).await;
                        let _ = stdout.flush().await;
                    }
                    Some(ProxyEvent::Closed) | None => break 0,
                }
            }
            _ = winch.recv() => {
                if let Some((cols, rows)) = get_window_size()
                    && let Err(e) = proxy.resize_grid(cols, rows)
                {
                    tracing::debug!("resize error: {e}");
                }
            }
        }
    };

    if let Some(ref termios) = orig_termios {
        restore_terminal(stdin_fd, termios);
    }

    eprintln!("\n\x1b[2m[session {session} closed]\x1b[0m");

    // stdin's blocking reader would otherwise keep the runtime alive
    std::process::exit(exit_code);
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();

    // Setup logging
    if args.debug {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".webterm")
            .join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_filename = format!("{timestamp}.log");
        let log_path = log_dir.join(&log_filename);
        let log_file = std::fs::File::create(&log_path)?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        eprintln!("debug log: {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let mut config = match &args.config {
        Some(path) => webterm_config::load_from(path)
            .wrap_err_with(|| format!("failed to load configuration from {}", path.display()))?,
        None => webterm_config::load().wrap_err("failed to load webterm configuration")?,
    };

    // Default to Serve if no command given
    let command = args.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        index: None,
    });

    match command {
        Command::Serve { host, port, index } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if index.is_some() {
                config.server.index = index;
            }
            webterm_server::run(config).await?;
        }
        Command::Open { url } => {
            run_open(config, url).await?;
        }
    }

    Ok(())
}
