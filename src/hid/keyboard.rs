//! Keyboard input report decoding.
//!
//! Input reports arriving on the interrupt channel are walked field by field
//! using the device's report descriptor. Keyboard page usages are translated
//! to characters with a simplified US layout. Decoding is edge triggered: a
//! key that is still held in the next report is not emitted again.

use std::sync::{Arc, LazyLock};

use smallvec::SmallVec;

use crate::hid::{
   descriptor::{BOOT_KEYBOARD_DESCRIPTOR, PAGE_KEYBOARD, ReportDescriptor},
   protocol::{INPUT_REPORT_HEADER, ReportType},
};

/// Maximum number of simultaneously tracked keys.
pub const NUM_KEYS: usize = 6;

const CHAR_ILLEGAL: u8 = 0xff;
const CHAR_RETURN: u8 = b'\n';
const CHAR_ESCAPE: u8 = 27;
const CHAR_TAB: u8 = b'\t';
const CHAR_BACKSPACE: u8 = 0x7f;

const USAGE_NONE: u16 = 0x00;
/// Usages that switch the rest of the report to the shifted table.
const SHIFT_USAGES: [u16; 2] = [0xE1, 0xE6];

const KEYTABLE_LEN: usize = 101;

#[rustfmt::skip]
const KEYTABLE_US_NONE: [u8; KEYTABLE_LEN] = [
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /*   0-3 */
   b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j',         /*  4-13 */
   b'k', b'l', b'm', b'n', b'o', b'p', b'q', b'r', b's', b't',         /* 14-23 */
   b'u', b'v', b'w', b'x', b'y', b'z',                                 /* 24-29 */
   b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0',         /* 30-39 */
   CHAR_RETURN, CHAR_ESCAPE, CHAR_BACKSPACE, CHAR_TAB, b' ',           /* 40-44 */
   b'-', b'=', b'[', b']', b'\\', CHAR_ILLEGAL, b';', b'\'', 0x60, b',', /* 45-54 */
   b'.', b'/', CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, /* 55-60 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 61-64 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 65-68 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 69-72 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 73-76 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 77-80 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 81-84 */
   b'*', b'-', b'+', b'\n', b'1', b'2', b'3', b'4', b'5',              /* 85-93 */
   b'6', b'7', b'8', b'9', b'0', b'.', 0xa7,                           /* 94-100 */
];

#[rustfmt::skip]
const KEYTABLE_US_SHIFT: [u8; KEYTABLE_LEN] = [
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /*   0-3 */
   b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'J',         /*  4-13 */
   b'K', b'L', b'M', b'N', b'O', b'P', b'Q', b'R', b'S', b'T',         /* 14-23 */
   b'U', b'V', b'W', b'X', b'Y', b'Z',                                 /* 24-29 */
   b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')',         /* 30-39 */
   CHAR_RETURN, CHAR_ESCAPE, CHAR_BACKSPACE, CHAR_TAB, b' ',           /* 40-44 */
   b'_', b'+', b'{', b'}', b'|', CHAR_ILLEGAL, b':', b'"', 0x7E, b'<', /* 45-54 */
   b'>', b'?', CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, /* 55-60 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 61-64 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 65-68 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 69-72 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 73-76 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 77-80 */
   CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL, CHAR_ILLEGAL,             /* 81-84 */
   b'*', b'-', b'+', b'\n', b'1', b'2', b'3', b'4', b'5',              /* 85-93 */
   b'6', b'7', b'8', b'9', b'0', b'.', 0xb1,                           /* 94-100 */
];

/// One item written to the character sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutput {
   Char(char),
   /// Erase the previous character.
   Erase,
}

pub type KeyOutputs = SmallVec<[KeyOutput; NUM_KEYS]>;

/// Keyboard page usage to character mapping.
#[derive(Debug)]
pub struct KeyUsageTable {
   unshifted: [u8; KEYTABLE_LEN],
   shifted: [u8; KEYTABLE_LEN],
}

/// English (US).
pub static KEYMAP_US: KeyUsageTable = KeyUsageTable {
   unshifted: KEYTABLE_US_NONE,
   shifted: KEYTABLE_US_SHIFT,
};

impl KeyUsageTable {
   pub const fn len(&self) -> usize {
      KEYTABLE_LEN
   }

   pub fn translate(&self, usage: u16, shift: bool) -> Option<KeyOutput> {
      let table = if shift { &self.shifted } else { &self.unshifted };
      match *table.get(usize::from(usage))? {
         CHAR_ILLEGAL => None,
         CHAR_BACKSPACE => Some(KeyOutput::Erase),
         // Latin-1 maps straight onto the first 256 code points
         key => Some(KeyOutput::Char(char::from(key))),
      }
   }
}

/// Keys reported as pressed by the previous report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEdgeState {
   keys: heapless::Vec<u16, NUM_KEYS>,
}

impl KeyEdgeState {
   pub fn contains(&self, usage: u16) -> bool {
      self.keys.contains(&usage)
   }

   /// Records a key; returns false when all slots are taken.
   fn insert(&mut self, usage: u16) -> bool {
      self.keys.push(usage).is_ok()
   }

   pub fn clear(&mut self) {
      self.keys.clear();
   }

   #[cfg(test)]
   pub fn keys(&self) -> &[u16] {
      &self.keys
   }
}

static BOOT_KEYBOARD: LazyLock<Arc<ReportDescriptor>> =
   LazyLock::new(|| Arc::new(ReportDescriptor::parse(BOOT_KEYBOARD_DESCRIPTOR)));

/// Per-device input report decoder.
#[derive(Debug, Clone)]
pub struct ReportDecoder {
   descriptor: Arc<ReportDescriptor>,
   keymap: &'static KeyUsageTable,
   last_keys: KeyEdgeState,
}

impl ReportDecoder {
   pub fn new(descriptor: Arc<ReportDescriptor>) -> Self {
      Self {
         descriptor,
         keymap: &KEYMAP_US,
         last_keys: KeyEdgeState::default(),
      }
   }

   /// Decoder for a device whose report descriptor is not known yet.
   pub fn boot_keyboard() -> Self {
      Self::new(BOOT_KEYBOARD.clone())
   }

   /// Replaces the descriptor and forgets the held keys.
   pub fn set_descriptor(&mut self, descriptor: Arc<ReportDescriptor>) {
      self.descriptor = descriptor;
      self.last_keys.clear();
   }

   pub fn reset(&mut self) {
      self.last_keys.clear();
   }

   #[cfg(test)]
   pub const fn last_keys(&self) -> &KeyEdgeState {
      &self.last_keys
   }

   /// Decodes one interrupt channel payload, including its header byte.
   ///
   /// Payloads that are not input reports are dropped without touching the
   /// held key state.
   pub fn decode(&mut self, payload: &[u8]) -> KeyOutputs {
      let mut out = KeyOutputs::new();
      let Some((&header, report)) = payload.split_first() else {
         return out;
      };
      if header != INPUT_REPORT_HEADER {
         return out;
      }

      let mut shift = false;
      let mut new_keys = KeyEdgeState::default();

      for field in self.descriptor.fields(ReportType::Input, report) {
         if field.usage_page != PAGE_KEYBOARD {
            continue;
         }
         if SHIFT_USAGES.contains(&field.usage) {
            if field.value != 0 {
               shift = true;
            }
            continue;
         }
         if field.usage == USAGE_NONE || usize::from(field.usage) >= self.keymap.len() {
            continue;
         }
         if !new_keys.insert(field.usage) {
            continue;
         }
         if self.last_keys.contains(field.usage) {
            continue;
         }
         if let Some(key) = self.keymap.translate(field.usage, shift) {
            out.push(key);
         }
      }

      self.last_keys = new_keys;
      out
   }
}
