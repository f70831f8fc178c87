/* RTTTL ringtone encoding: parses "name:d=D,o=O,b=B:notes" tone strings into the
 * (duration, note) byte pairs the handheld firmware plays. */

use tracing::warn;

use crate::error::DriverError;

/* Note code for a rest. Rests do not play reliably on the handheld. */
const REST: u8 = 0x7f;

/* The device duration byte counts 2.56 ms ticks. */
const MS_PER_TICK: f64 = 2.56;

/* Recognized note-duration denominators, for both the defaults section and
 * per-note prefixes. */
const DURATIONS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/* A tone decoded to the device byte format: alternating duration and note
 * bytes. Immutable after construction. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ringtone {
    name: String,
    tone_bytes: Vec<u8>,
}

impl Ringtone {
    /* A one-tick rest, pushed for events the application left silent. */
    pub fn muted() -> Self {
        Self {
            name: String::new(),
            tone_bytes: vec![0x01, REST],
        }
    }

    /* Connect-time fallback: a bad tone mutes that event instead of failing
     * the connection. */
    pub fn parse_or_muted(tone_data: &str) -> Self {
        match Self::parse(tone_data) {
            Ok(tone) => tone,
            Err(e) => {
                warn!("{}; substituting the mute tone", e);
                Self::muted()
            }
        }
    }

    pub fn parse(tone_data: &str) -> Result<Self, DriverError> {
        let cleaned = tone_data.replace(' ', "");
        let sections: Vec<&str> = cleaned.split(':').collect();
        if sections.len() < 3 {
            return Err(DriverError::InvalidRtttl(
                "expected name:defaults:notes".to_string(),
            ));
        }
        let notes = sections[sections.len() - 1];
        let defaults = sections[sections.len() - 2];
        let name = sections[..sections.len() - 2].join(":");

        let mut duration = 4u32;
        let mut octave = 4u32;
        let mut bpm = 120u32;
        for arg in defaults.split(',').filter(|a| !a.is_empty()) {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| DriverError::InvalidRtttl(format!("malformed default {arg:?}")))?;
            let value: u32 = value
                .parse()
                .map_err(|_| DriverError::InvalidRtttl(format!("malformed default {arg:?}")))?;
            match key {
                "d" => {
                    if !DURATIONS.contains(&value) {
                        return Err(DriverError::InvalidRtttl(format!(
                            "invalid default duration {value}"
                        )));
                    }
                    duration = value;
                }
                "o" => {
                    if !(4..=7).contains(&value) {
                        return Err(DriverError::InvalidRtttl(format!(
                            "invalid default octave {value}"
                        )));
                    }
                    octave = value;
                }
                "b" => {
                    if value == 0 {
                        return Err(DriverError::InvalidRtttl("invalid tempo 0".to_string()));
                    }
                    bpm = value;
                }
                _ => {
                    return Err(DriverError::InvalidRtttl(format!(
                        "unknown default {key:?}"
                    )));
                }
            }
        }

        let mut tone_bytes = Vec::new();
        for note in notes.split(',').filter(|n| !n.is_empty()) {
            let (ticks, code) = parse_note(note, duration, octave, bpm)?;
            tone_bytes.push(ticks);
            tone_bytes.push(code);
        }

        Ok(Self { name, tone_bytes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tone_bytes(&self) -> &[u8] {
        &self.tone_bytes
    }
}

/* One note: `[duration][letter][#][octave][.]`, everything but the letter
 * optional. The dot is accepted on either side of the octave and ignored. */
fn parse_note(
    note: &str,
    default_duration: u32,
    default_octave: u32,
    bpm: u32,
) -> Result<(u8, u8), DriverError> {
    let mut chars = note.chars().peekable();

    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    let note_duration = if digits.is_empty() {
        default_duration
    } else {
        let value: u32 = digits
            .parse()
            .map_err(|_| DriverError::InvalidRtttl(format!("malformed note {note:?}")))?;
        if !DURATIONS.contains(&value) {
            return Err(DriverError::InvalidRtttl(format!(
                "invalid duration in note {note:?}"
            )));
        }
        value
    };

    let letter = chars
        .next()
        .ok_or_else(|| DriverError::InvalidRtttl(format!("empty note {note:?}")))?
        .to_ascii_lowercase();

    let sharp = chars.peek() == Some(&'#');
    if sharp {
        chars.next();
    }
    if chars.peek() == Some(&'.') {
        chars.next();
    }
    let octave = match chars.peek().copied() {
        Some(c) if c.is_ascii_digit() => {
            chars.next();
            c.to_digit(10).unwrap_or(0)
        }
        _ => default_octave,
    };
    if chars.peek() == Some(&'.') {
        chars.next();
    }
    if chars.next().is_some() {
        return Err(DriverError::InvalidRtttl(format!(
            "trailing data in note {note:?}"
        )));
    }

    let code = if letter == 'p' {
        warn!("RTTTL: rests do not play reliably on the handheld");
        REST
    } else {
        note_code(letter, sharp, octave)
            .ok_or_else(|| DriverError::InvalidRtttl(format!("invalid note {note:?}")))?
    };

    let note_ms = 60_000.0 * 4.0 / f64::from(bpm) / f64::from(note_duration);
    let ticks = (note_ms / MS_PER_TICK).round().clamp(1.0, 255.0) as u8;
    Ok((ticks, code))
}

/* Look up a note in the device table, which covers c4..b7 with sharps. The
 * firmware skips codes 0x18..0x1f: the table jumps from a5# (0x17) to b5
 * (0x20). e# and b# have no entries. */
fn note_code(letter: char, sharp: bool, octave: u32) -> Option<u8> {
    if !(4..=7).contains(&octave) {
        return None;
    }
    let semitone: u32 = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };
    if sharp && (letter == 'e' || letter == 'b') {
        return None;
    }
    let index = (octave - 4) * 12 + semitone + u32::from(sharp);
    let code = 0x01 + index;
    let code = if code >= 0x18 { code + 8 } else { code };
    Some(code as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteenth_notes_at_140_bpm() {
        let tone = Ringtone::parse("Dang:d=4,o=5,b=140:16g#5,16e5,16c#5").unwrap();
        assert_eq!(tone.name, "Dang");
        assert_eq!(tone.tone_bytes(), &[42, 0x15, 42, 0x11, 42, 0x0e]);
    }

    #[test]
    fn defaults_apply_when_notes_are_bare() {
        /* d=4, o=4, b=120 unless the defaults section overrides them. */
        let tone = Ringtone::parse("Test::c").unwrap();
        /* A quarter note at 120 bpm is 500 ms -> 195 ticks. */
        assert_eq!(tone.tone_bytes(), &[195, 0x01]);
    }

    #[test]
    fn note_table_boundaries() {
        let tone = Ringtone::parse("Test:d=4,o=4,b=120:c4,a#5,b5,b7").unwrap();
        let codes: Vec<u8> = tone.tone_bytes().iter().skip(1).step_by(2).copied().collect();
        assert_eq!(codes, vec![0x01, 0x17, 0x20, 0x38]);
    }

    #[test]
    fn rest_encodes_as_7f() {
        let tone = Ringtone::parse("Test:d=4,o=5,b=120:p").unwrap();
        assert_eq!(tone.tone_bytes()[1], 0x7f);
    }

    #[test]
    fn muted_is_a_one_tick_rest() {
        assert_eq!(Ringtone::muted().tone_bytes(), &[0x01, 0x7f]);
    }

    #[test]
    fn long_notes_clamp_to_255() {
        /* A whole note at 10 bpm is 24 seconds, far past the byte range. */
        let tone = Ringtone::parse("Test:d=1,o=5,b=10:c").unwrap();
        assert_eq!(tone.tone_bytes()[0], 255);
    }

    #[test]
    fn dotted_notes_are_accepted_and_ignored() {
        let plain = Ringtone::parse("Test:d=4,o=5,b=112:b5,g5").unwrap();
        let dotted = Ringtone::parse("Test:d=4,o=5,b=112:b.5,g5.").unwrap();
        assert_eq!(plain.tone_bytes(), dotted.tone_bytes());
    }

    #[test]
    fn spaces_are_stripped() {
        let tone = Ringtone::parse("Test:d=4,o=5,b=140: 16g#5, 16e5").unwrap();
        assert_eq!(tone.tone_bytes().len(), 4);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Ringtone::parse("no sections here").is_err());
        assert!(Ringtone::parse("Test:d=3:c").is_err());
        assert!(Ringtone::parse("Test:o=8:c").is_err());
        assert!(Ringtone::parse("Test:b=0:c").is_err());
        assert!(Ringtone::parse("Test:x=1:c").is_err());
        assert!(Ringtone::parse("Test::h").is_err());
        assert!(Ringtone::parse("Test::c8").is_err());
        assert!(Ringtone::parse("Test::3c").is_err());
        assert!(Ringtone::parse("Test::e#5").is_err());
    }

    #[test]
    fn parse_or_muted_downgrades_bad_tones() {
        assert_eq!(Ringtone::parse_or_muted("garbage").tone_bytes(), &[0x01, 0x7f]);
        assert_ne!(
            Ringtone::parse_or_muted("Test:d=4,o=5,b=140:16g#5").tone_bytes(),
            &[0x01, 0x7f]
        );
    }

    #[test]
    fn emitted_bytes_stay_in_range() {
        let tone =
            Ringtone::parse("Dang:d=16,o=6,b=200:c,e,d7,c,e,a#,c,e,p,32b,1c4").unwrap();
        for pair in tone.tone_bytes().chunks(2) {
            assert!(pair[0] >= 1);
            let note = pair[1];
            assert!(
                (0x01..=0x17).contains(&note)
                    || (0x20..=0x38).contains(&note)
                    || note == 0x7f,
                "note {note:#04x} outside the device table"
            );
        }
    }
}
