use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd};

use anyhow::Result;
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};

/// RAII guard to restore terminal mode on drop.
pub struct RawModeGuard {
    original_termios: Option<Termios>,
    #[allow(dead_code)]
    fd: std::os::fd::RawFd,
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        let stdin = std::io::stdin();
        let fd = stdin.as_fd().as_raw_fd();

        if !stdin.is_terminal() {
            return Ok(Self {
                original_termios: None,
                fd,
            });
        }

        let original_termios = tcgetattr(&stdin)?;
        let mut raw = original_termios.clone();

        raw.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON);
        raw.output_flags &= !OutputFlags::OPOST;
        raw.local_flags &= !(LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN);

        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        Ok(Self {
            original_termios: Some(original_termios),
            fd,
        })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(termios) = &self.original_termios {
            let stdin = std::io::stdin();
            let _ = tcsetattr(&stdin, SetArg::TCSANOW, termios);
        }
    }
}
