//! HID report descriptor parsing.
//!
//! A report descriptor is a sequence of short items describing the layout of
//! every report a device sends or accepts. The descriptor is parsed once into
//! a flat list of main items; [`ReportDescriptor::fields`] then walks a raw
//! report and yields one `(usage page, usage, value)` triple per field.
//!
//! Nested collections are flattened and delimiters are ignored. Long items
//! are skipped.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::hid::protocol::ReportType;

pub const PAGE_KEYBOARD: u16 = 0x07;

/// Boot protocol keyboard layout, used when a device's own descriptor is unknown.
pub const BOOT_KEYBOARD_DESCRIPTOR: &[u8] = &[
   0x05, 0x01, // Usage Page (Generic Desktop)
   0x09, 0x06, // Usage (Keyboard)
   0xA1, 0x01, // Collection (Application)
   0x05, 0x07, //   Usage Page (Keyboard/Keypad)
   0x19, 0xE0, //   Usage Minimum (Left Control)
   0x29, 0xE7, //   Usage Maximum (Right GUI)
   0x15, 0x00, //   Logical Minimum (0)
   0x25, 0x01, //   Logical Maximum (1)
   0x75, 0x01, //   Report Size (1)
   0x95, 0x08, //   Report Count (8)
   0x81, 0x02, //   Input (Data, Variable, Absolute)
   0x95, 0x01, //   Report Count (1)
   0x75, 0x08, //   Report Size (8)
   0x81, 0x01, //   Input (Constant)
   0x05, 0x08, //   Usage Page (LEDs)
   0x19, 0x01, //   Usage Minimum (Num Lock)
   0x29, 0x05, //   Usage Maximum (Kana)
   0x95, 0x05, //   Report Count (5)
   0x75, 0x01, //   Report Size (1)
   0x91, 0x02, //   Output (Data, Variable, Absolute)
   0x95, 0x01, //   Report Count (1)
   0x75, 0x03, //   Report Size (3)
   0x91, 0x01, //   Output (Constant)
   0x05, 0x07, //   Usage Page (Keyboard/Keypad)
   0x19, 0x00, //   Usage Minimum (0)
   0x29, 0xFF, //   Usage Maximum (255)
   0x15, 0x00, //   Logical Minimum (0)
   0x26, 0xFF, 0x00, // Logical Maximum (255)
   0x95, 0x06, //   Report Count (6)
   0x75, 0x08, //   Report Size (8)
   0x81, 0x00, //   Input (Data, Array)
   0xC0, // End Collection
];

const ITEM_TYPE_MAIN: u8 = 0;
const ITEM_TYPE_GLOBAL: u8 = 1;
const ITEM_TYPE_LOCAL: u8 = 2;
const LONG_ITEM_PREFIX: u8 = 0xFE;

const FLAG_CONSTANT: u32 = 1 << 0;
const FLAG_VARIABLE: u32 = 1 << 1;

/// One decoded report field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportField {
   pub usage_page: u16,
   pub usage: u16,
   pub value: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct GlobalState {
   usage_page: u16,
   logical_minimum: i32,
   logical_maximum: i32,
   report_size: u32,
   report_id: u8,
   report_count: u32,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
   usages: SmallVec<[u32; 8]>,
   usage_minimum: Option<u32>,
   usage_maximum: Option<u32>,
}

/// An Input, Output or Feature item with the state that was in effect.
#[derive(Debug, Clone)]
struct MainItem {
   report_type: ReportType,
   report_id: u8,
   flags: u32,
   report_size: u32,
   report_count: u32,
   logical_minimum: i32,
   logical_maximum: i32,
   usage_page: u16,
   usages: SmallVec<[u32; 8]>,
   usage_minimum: Option<u32>,
   usage_maximum: Option<u32>,
}

impl MainItem {
   const fn is_constant(&self) -> bool {
      self.flags & FLAG_CONSTANT != 0
   }

   const fn is_variable(&self) -> bool {
      self.flags & FLAG_VARIABLE != 0
   }

   /// Extends a 16-bit usage with the item's usage page.
   fn extend(&self, usage: u32) -> u32 {
      if usage >> 16 == 0 {
         (u32::from(self.usage_page) << 16) | usage
      } else {
         usage
      }
   }

   fn variable_usage(&self, index: u32) -> u32 {
      if let Some(last) = self.usages.last() {
         let usage = self.usages.get(index as usize).unwrap_or(last);
         return self.extend(*usage);
      }
      match self.usage_minimum.and_then(|min| min.checked_add(index)) {
         Some(usage) => self.extend(self.usage_maximum.map_or(usage, |max| usage.min(max))),
         None => self.extend(0),
      }
   }

   fn array_usage(&self, value: i32) -> u32 {
      if value < self.logical_minimum || value > self.logical_maximum {
         return self.extend(0);
      }
      let index = value.abs_diff(self.logical_minimum);
      match self.usage_minimum {
         Some(min) => self.extend(min.checked_add(index).unwrap_or(0)),
         None => self
            .usages
            .get(index as usize)
            .map_or_else(|| self.extend(0), |u| self.extend(*u)),
      }
   }
}

/// A parsed report descriptor.
#[derive(Debug, Clone, Default)]
pub struct ReportDescriptor {
   bytes: Vec<u8>,
   items: Vec<MainItem>,
   uses_report_ids: bool,
}

impl ReportDescriptor {
   pub fn parse(data: &[u8]) -> Self {
      let mut items = Vec::new();
      let mut global = GlobalState::default();
      let mut stack: Vec<GlobalState> = Vec::new();
      let mut local = LocalState::default();

      let mut i = 0;
      while i < data.len() {
         let prefix = data[i];

         if prefix == LONG_ITEM_PREFIX {
            let Some(&len) = data.get(i + 1) else {
               break;
            };
            i += 3 + len as usize;
            continue;
         }

         let size = match prefix & 0x03 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
         };

         if i + 1 + size > data.len() {
            warn!("Report descriptor truncated at offset {i}");
            break;
         }

         let raw = &data[i + 1..i + 1 + size];
         let unsigned = raw
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
         let signed = match size {
            1 => i32::from(raw[0] as i8),
            2 => i32::from(i16::from_le_bytes([raw[0], raw[1]])),
            4 => unsigned as i32,
            _ => 0,
         };

         let tag = prefix >> 4;
         match (prefix >> 2) & 0x03 {
            ITEM_TYPE_MAIN => {
               let report_type = match tag {
                  0x8 => Some(ReportType::Input),
                  0x9 => Some(ReportType::Output),
                  0xB => Some(ReportType::Feature),
                  // Collection / End Collection
                  _ => None,
               };
               if report_type.is_some() && global.report_size == 0 {
                  debug!("Skipping zero-size main item at offset {i}");
               } else if let Some(report_type) = report_type {
                  items.push(MainItem {
                     report_type,
                     report_id: global.report_id,
                     flags: unsigned,
                     report_size: global.report_size,
                     report_count: global.report_count,
                     logical_minimum: global.logical_minimum,
                     logical_maximum: global.logical_maximum,
                     usage_page: global.usage_page,
                     usages: local.usages.clone(),
                     usage_minimum: local.usage_minimum,
                     usage_maximum: local.usage_maximum,
                  });
               }
               local = LocalState::default();
            },
            ITEM_TYPE_GLOBAL => match tag {
               0x0 => global.usage_page = unsigned as u16,
               0x1 => global.logical_minimum = signed,
               0x2 => {
                  global.logical_maximum = if global.logical_minimum < 0 {
                     signed
                  } else {
                     unsigned as i32
                  }
               },
               0x7 => global.report_size = unsigned,
               0x8 => global.report_id = unsigned as u8,
               0x9 => global.report_count = unsigned,
               0xA => stack.push(global),
               0xB => {
                  if let Some(state) = stack.pop() {
                     global = state;
                  }
               },
               _ => {},
            },
            ITEM_TYPE_LOCAL => {
               // 4-byte usages carry their own page in the high half
               let usage = if size == 4 { unsigned } else { unsigned & 0xffff };
               match tag {
                  0x0 => local.usages.push(usage),
                  0x1 => local.usage_minimum = Some(usage),
                  0x2 => local.usage_maximum = Some(usage),
                  _ => {},
               }
            },
            _ => {},
         }

         i += 1 + size;
      }

      let uses_report_ids = items.iter().any(|item| item.report_id != 0);
      debug!(
         "Parsed report descriptor: {} bytes, {} main items, report ids: {uses_report_ids}",
         data.len(),
         items.len()
      );

      Self {
         bytes: data.to_vec(),
         items,
         uses_report_ids,
      }
   }

   pub fn as_bytes(&self) -> &[u8] {
      &self.bytes
   }

   pub fn is_empty(&self) -> bool {
      self.items.is_empty()
   }

   pub const fn uses_report_ids(&self) -> bool {
      self.uses_report_ids
   }

   /// Iterates the fields of `report` (without the transport header byte).
   ///
   /// When the descriptor declares report ids, the first byte of `report`
   /// selects which items apply.
   pub fn fields<'a>(&'a self, report_type: ReportType, report: &'a [u8]) -> Fields<'a> {
      let (report_id, data) = if self.uses_report_ids {
         match report.split_first() {
            Some((id, rest)) => (*id, rest),
            None => (0, report),
         }
      } else {
         (0, report)
      };
      Fields {
         items: if self.uses_report_ids && report.is_empty() {
            &[]
         } else {
            &self.items[..]
         },
         report_type,
         report_id,
         data,
         item: 0,
         index: 0,
         bit: 0,
      }
   }
}

/// Iterator over the fields of one report.
pub struct Fields<'a> {
   items: &'a [MainItem],
   report_type: ReportType,
   report_id: u8,
   data: &'a [u8],
   item: usize,
   index: u32,
   bit: usize,
}

impl Iterator for Fields<'_> {
   type Item = ReportField;

   fn next(&mut self) -> Option<ReportField> {
      loop {
         let item = self.items.get(self.item)?;
         if item.report_type != self.report_type
            || item.report_id != self.report_id
            || self.index >= item.report_count
         {
            self.item += 1;
            self.index = 0;
            continue;
         }

         let size = item.report_size as usize;
         if self.bit + size > self.data.len() * 8 {
            return None;
         }
         let raw = read_bits(self.data, self.bit, size);
         self.bit += size;
         let index = self.index;
         self.index += 1;

         if item.is_constant() {
            continue;
         }

         let value = if item.logical_minimum < 0 {
            sign_extend(raw, size)
         } else {
            raw as i32
         };
         let usage = if item.is_variable() {
            item.variable_usage(index)
         } else {
            item.array_usage(value)
         };

         return Some(ReportField {
            usage_page: (usage >> 16) as u16,
            usage: (usage & 0xffff) as u16,
            value,
         });
      }
   }
}

fn read_bits(data: &[u8], offset: usize, count: usize) -> u32 {
   (0..count.min(32)).fold(0u32, |acc, i| {
      let bit = offset + i;
      if (data[bit / 8] >> (bit % 8)) & 1 != 0 {
         acc | (1 << i)
      } else {
         acc
      }
   })
}

fn sign_extend(raw: u32, bits: usize) -> i32 {
   if bits == 0 || bits >= 32 {
      return raw as i32;
   }
   let shift = 32 - bits as u32;
   ((raw << shift) as i32) >> shift
}

#[cfg(test)]
mod tests {
   use super::*;

   const PAGE_GENERIC_DESKTOP: u16 = 0x01;
   const PAGE_LED: u16 = 0x08;

   fn input_fields(desc: &ReportDescriptor, report: &[u8]) -> Vec<ReportField> {
      desc.fields(ReportType::Input, report).collect()
   }

   #[test]
   fn test_boot_keyboard_fields() {
      let desc = ReportDescriptor::parse(BOOT_KEYBOARD_DESCRIPTOR);
      assert!(!desc.uses_report_ids());
      assert_eq!(desc.as_bytes(), BOOT_KEYBOARD_DESCRIPTOR);

      // Left shift held, 'a' and 'b' down
      let fields = input_fields(&desc, &[0x02, 0x00, 0x04, 0x05, 0, 0, 0, 0]);

      // 8 modifier bits + 6 array slots; the padding byte is skipped
      assert_eq!(fields.len(), 14);
      assert!(fields.iter().all(|f| f.usage_page == PAGE_KEYBOARD));
      assert_eq!(
         fields[1],
         ReportField {
            usage_page: PAGE_KEYBOARD,
            usage: 0xE1,
            value: 1
         }
      );
      assert_eq!(fields[0].usage, 0xE0);
      assert_eq!(fields[0].value, 0);
      assert_eq!(fields[8].usage, 0x04);
      assert_eq!(fields[9].usage, 0x05);
      assert_eq!(fields[10].usage, 0x00);
   }

   #[test]
   fn test_output_items_are_separate() {
      let desc = ReportDescriptor::parse(BOOT_KEYBOARD_DESCRIPTOR);
      let leds: Vec<_> = desc.fields(ReportType::Output, &[0b0000_0011]).collect();
      assert_eq!(leds.len(), 5);
      assert!(leds.iter().all(|f| f.usage_page == PAGE_LED));
      assert_eq!(leds[0].value, 1);
      assert_eq!(leds[1].value, 1);
      assert_eq!(leds[2].value, 0);
   }

   #[test]
   fn test_truncated_report_stops_at_last_complete_field() {
      let desc = ReportDescriptor::parse(BOOT_KEYBOARD_DESCRIPTOR);
      let fields = input_fields(&desc, &[0x00, 0x00, 0x04]);
      assert_eq!(fields.len(), 9);
      assert_eq!(fields[8].usage, 0x04);
   }

   #[test]
   fn test_report_ids_select_items() {
      #[rustfmt::skip]
      let data = [
         0x05, 0x07, 0x85, 0x01, // Usage Page (Keyboard), Report ID (1)
         0x19, 0x00, 0x29, 0x65, 0x15, 0x00, 0x25, 0x65,
         0x75, 0x08, 0x95, 0x02, 0x81, 0x00, // Input (Array) x2
         0x05, 0x01, 0x85, 0x02, // Usage Page (Generic Desktop), Report ID (2)
         0x09, 0x30, 0x09, 0x31, // Usage (X), Usage (Y)
         0x15, 0x81, 0x25, 0x7F, // Logical -127..127
         0x75, 0x08, 0x95, 0x02, 0x81, 0x06, // Input (Data, Variable, Relative)
      ];
      let desc = ReportDescriptor::parse(&data);
      assert!(desc.uses_report_ids());

      let keys = input_fields(&desc, &[0x01, 0x04, 0x00]);
      assert_eq!(keys.len(), 2);
      assert_eq!(keys[0].usage_page, PAGE_KEYBOARD);
      assert_eq!(keys[0].usage, 0x04);

      let motion = input_fields(&desc, &[0x02, 0xFE, 0x05]);
      assert_eq!(motion.len(), 2);
      assert_eq!(motion[0].usage_page, PAGE_GENERIC_DESKTOP);
      assert_eq!(motion[0].usage, 0x30);
      assert_eq!(motion[0].value, -2);
      assert_eq!(motion[1].usage, 0x31);
      assert_eq!(motion[1].value, 5);

      assert!(input_fields(&desc, &[0x03, 0x00]).is_empty());
      assert!(input_fields(&desc, &[]).is_empty());
   }

   #[test]
   fn test_array_value_outside_logical_range() {
      #[rustfmt::skip]
      let data = [
         0x05, 0x07, 0x19, 0x04, 0x29, 0x10,
         0x15, 0x01, 0x25, 0x0D, // Logical 1..13
         0x75, 0x08, 0x95, 0x01, 0x81, 0x00,
      ];
      let desc = ReportDescriptor::parse(&data);
      assert_eq!(input_fields(&desc, &[0x01])[0].usage, 0x04);
      assert_eq!(input_fields(&desc, &[0x03])[0].usage, 0x06);
      assert_eq!(input_fields(&desc, &[0x00])[0].usage, 0x00);
   }

   #[test]
   fn test_push_pop_and_extended_usage() {
      #[rustfmt::skip]
      let data = [
         0x05, 0x07, 0xA4, // Usage Page (Keyboard), Push
         0x05, 0x01, 0xB4, // Usage Page (Generic Desktop), Pop
         0x0B, 0x04, 0x00, 0x0C, 0x00, // Usage (Consumer: 0x0004)
         0x75, 0x01, 0x95, 0x01, 0x81, 0x02,
         0x09, 0x05, 0x75, 0x07, 0x95, 0x01, 0x81, 0x02,
      ];
      let desc = ReportDescriptor::parse(&data);
      let fields = input_fields(&desc, &[0xFF]);
      assert_eq!(fields.len(), 2);
      assert_eq!(fields[0].usage_page, 0x0C);
      assert_eq!(fields[0].usage, 0x04);
      assert_eq!(fields[1].usage_page, PAGE_KEYBOARD);
      assert_eq!(fields[1].usage, 0x05);
      assert_eq!(fields[1].value, 0x7F);
   }

   #[test]
   fn test_truncated_descriptor_keeps_complete_items() {
      let desc = ReportDescriptor::parse(&BOOT_KEYBOARD_DESCRIPTOR[..23]);
      assert!(!desc.is_empty());
      assert!(ReportDescriptor::parse(&[0x05]).is_empty());
   }

   #[test]
   fn test_usage_minimum_at_top_of_range() {
      #[rustfmt::skip]
      let data = [
         0x1B, 0xFF, 0xFF, 0xFF, 0xFF, // Usage Minimum (0xFFFFFFFF)
         0x15, 0x00, 0x25, 0x03,
         0x75, 0x08, 0x95, 0x01, 0x81, 0x00, // Input (Data, Array)
         0x1B, 0xFF, 0xFF, 0xFF, 0xFF,
         0x75, 0x01, 0x95, 0x02, 0x81, 0x02, // Input (Data, Variable)
      ];
      let desc = ReportDescriptor::parse(&data);
      let fields = input_fields(&desc, &[0x01, 0x03]);
      assert_eq!(fields.len(), 3);
      assert_eq!((fields[0].usage_page, fields[0].usage), (0, 0));
      assert_eq!((fields[1].usage_page, fields[1].usage), (0xFFFF, 0xFFFF));
      assert_eq!((fields[2].usage_page, fields[2].usage), (0, 0));
   }

   #[test]
   fn test_zero_size_items_are_dropped() {
      #[rustfmt::skip]
      let data = [
         0x05, 0x07,
         0x75, 0x00, 0x97, 0xFF, 0xFF, 0xFF, 0x0F, 0x81, 0x02, // Report Size (0), huge count
         0x75, 0x08, 0x95, 0x01, 0x09, 0x04, 0x81, 0x02,
      ];
      let desc = ReportDescriptor::parse(&data);
      let fields = input_fields(&desc, &[0x2A]);
      assert_eq!(fields.len(), 1);
      assert_eq!(fields[0].usage, 0x04);
      assert_eq!(fields[0].value, 0x2A);

      assert!(input_fields(&ReportDescriptor::parse(&data[..11]), &[0x00]).is_empty());
   }

   #[test]
   fn test_bit_helpers() {
      assert_eq!(read_bits(&[0b1010_1100, 0x01], 2, 8), 0b0110_1011);
      assert_eq!(sign_extend(0xFE, 8), -2);
      assert_eq!(sign_extend(0x7, 4), 7);
      assert_eq!(sign_extend(0x8, 4), -8);
   }
}
