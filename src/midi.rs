// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! MIDI keyboard state tracking.
//!
//! Plain bookkeeping over the 128 keys plus the sustain pedal. MIDI
//! parsing happens outside this crate; embedders feed note and pedal
//! transitions in and query key states when building triggers.

/// Number of tracked keys.
pub const NUM_KEYS: usize = 128;

/// State of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Pressed,
    /// Released while the sustain pedal was down.
    Sustained,
}

/// On/off and sustain state across the keyboard.
#[derive(Debug)]
pub struct MidiKeyboardState {
    sustain: bool,
    keys: [KeyState; NUM_KEYS],
}

impl MidiKeyboardState {
    pub fn new() -> Self {
        Self {
            sustain: false,
            keys: [KeyState::Idle; NUM_KEYS],
        }
    }

    /// Returns everything to idle, pedal up.
    pub fn reset(&mut self) {
        self.sustain = false;
        self.keys = [KeyState::Idle; NUM_KEYS];
    }

    pub fn note_on(&mut self, key: usize) {
        if let Some(state) = self.keys.get_mut(key) {
            *state = KeyState::Pressed;
        }
    }

    /// A released key parks in `Sustained` while the pedal is down.
    pub fn note_off(&mut self, key: usize) {
        if let Some(state) = self.keys.get_mut(key) {
            *state = if self.sustain {
                KeyState::Sustained
            } else {
                KeyState::Idle
            };
        }
    }

    pub fn sustain_on(&mut self) {
        self.sustain = true;
    }

    /// Lifting the pedal idles all sustained keys; held keys stay pressed.
    pub fn sustain_off(&mut self) {
        self.sustain = false;
        for state in &mut self.keys {
            if *state == KeyState::Sustained {
                *state = KeyState::Idle;
            }
        }
    }

    pub fn key_state(&self, key: usize) -> KeyState {
        self.keys.get(key).copied().unwrap_or(KeyState::Idle)
    }

    pub fn is_key_idle(&self, key: usize) -> bool {
        self.key_state(key) == KeyState::Idle
    }

    pub fn is_key_pressed(&self, key: usize) -> bool {
        self.key_state(key) == KeyState::Pressed
    }

    pub fn is_key_sustained(&self, key: usize) -> bool {
        self.key_state(key) == KeyState::Sustained
    }

    pub fn is_sustain_on(&self) -> bool {
        self.sustain
    }
}

impl Default for MidiKeyboardState {
    fn default() -> Self {
        Self::new()
    }
}
