use std::io;
use std::thread;
use std::time::{Duration, Instant};

use super::ShellChannel;
use crate::config::PollSettings;
use crate::error::{PollError, PollResult};

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    AwaitingPrompt,
    Done,
}

/// Accumulates shell output until the prompt marker shows up.
#[derive(Debug)]
pub struct PromptWaiter<'a> {
    marker: &'a [u8],
    buffer: Vec<u8>,
    state: PromptState,
}

impl<'a> PromptWaiter<'a> {
    pub fn new(marker: &'a str) -> Self {
        Self {
            marker: marker.as_bytes(),
            buffer: Vec::new(),
            state: PromptState::AwaitingPrompt,
        }
    }

    pub fn state(&self) -> PromptState {
        self.state
    }

    pub fn push(&mut self, chunk: &[u8]) -> PromptState {
        if self.state == PromptState::Done {
            return self.state;
        }
        // The marker may straddle the previous chunk boundary.
        let search_from = self
            .buffer
            .len()
            .saturating_sub(self.marker.len().saturating_sub(1));
        self.buffer.extend_from_slice(chunk);
        if contains(&self.buffer[search_from..], self.marker) {
            self.state = PromptState::Done;
        }
        self.state
    }

    /// Collected output, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// Reads until `marker` appears, pausing `poll_interval` whenever the channel
/// has nothing ready. Gives up once `timeout` has elapsed.
pub fn await_prompt<C>(
    channel: &mut C,
    marker: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> PollResult<String>
where
    C: ShellChannel + ?Sized,
{
    let started = Instant::now();
    let mut waiter = PromptWaiter::new(marker);
    let mut chunk = [0u8; READ_CHUNK];

    while waiter.state() == PromptState::AwaitingPrompt {
        if started.elapsed() > timeout {
            return Err(PollError::ProtocolTimeout {
                marker: marker.to_string(),
            });
        }
        match channel.try_read(&mut chunk) {
            Ok(Some(read)) if read > 0 => {
                waiter.push(&chunk[..read]);
            }
            Ok(_) => thread::sleep(poll_interval),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll_interval),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(PollError::Channel(format!("read failed: {err}"))),
        }
    }

    Ok(waiter.text())
}

pub fn send_command<C>(channel: &mut C, command: &str) -> PollResult<()>
where
    C: ShellChannel + ?Sized,
{
    let line = format!("{command}\n");
    channel
        .write_all(line.as_bytes())
        .map_err(|err| PollError::Channel(format!("failed to send {command:?}: {err}")))
}

/// Prompt, command, prompt. Returns the output captured after the command.
pub fn run_round_trip<C>(channel: &mut C, settings: &PollSettings) -> PollResult<String>
where
    C: ShellChannel + ?Sized,
{
    await_prompt(
        channel,
        &settings.prompt_marker,
        settings.prompt_timeout,
        settings.prompt_poll_interval,
    )?;
    send_command(channel, &settings.command)?;
    await_prompt(
        channel,
        &settings.prompt_marker,
        settings.prompt_timeout,
        settings.prompt_poll_interval,
    )
}
