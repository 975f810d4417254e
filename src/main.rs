//! redirectd: mirror redirector daemon.
//!
//! ```text
//!                       ┌──────────────────────────────────────────────┐
//!   client ────────────▶│ net listener ─▶ http server ─▶ 302 to mirror │
//!                       │        ▲                           ▲         │
//!                       │        │ fd 3 on upgrade           │ store   │
//!   SIGHUP/QUIT/USR1/2 ▶│  lifecycle dispatcher         monitor ◀── probes
//!   control channel ───▶│  (reload, drain, upgrade)                    │
//!                       └──────────────────────────────────────────────┘
//! ```

fn main() {
    std::process::exit(redirectd::cli::run(std::env::args_os()));
}
