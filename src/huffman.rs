use core::fmt;

use crate::error::{Error, Result};

/// Canonical Huffman codes derived from a DHT table, in the form the hardware's DHT FIFO expects.
///
/// The codec does not take the raw `BITS`/`HUFFVAL` lists directly: besides the code values it
/// needs the smallest code of every code length, so that it can resolve a code of length `l` by
/// comparing against `min_codes[l - 1]` and indexing the value list.
pub struct HuffmanCodes {
    counts: [u8; 16],
    min_codes: [u32; 16],
}

impl HuffmanCodes {
    pub fn build(num_codes_per_length: &[u8; 16], values: &[u8]) -> Result<Self> {
        let total: usize = num_codes_per_length.iter().map(|&n| usize::from(n)).sum();
        if total != values.len() {
            return Err(Error::invalid_arg(format!(
                "Huffman table declares {total} codes but provides {} values",
                values.len()
            )));
        }

        let mut min_codes = [0; 16];

        // The following is similar in function to the flowcharts in Annex C
        // (`Generate_size_table` and `Generate_code_table`)
        let mut next_code: u32 = 0;
        for (code_length, &code_count) in num_codes_per_length.iter().enumerate() {
            let bits = code_length + 1; // 1-based

            next_code <<= 1;
            min_codes[code_length] = next_code;
            next_code += u32::from(code_count);
            if next_code > 1 << bits {
                return Err(Error::invalid_arg(format!(
                    "Huffman table overflows the {bits}-bit code space"
                )));
            }
        }

        Ok(Self {
            counts: *num_codes_per_length,
            min_codes,
        })
    }

    /// Returns the smallest code of each length (index 0 is length 1).
    #[inline]
    pub fn min_codes(&self) -> &[u32; 16] {
        &self.min_codes
    }
}

impl fmt::Debug for HuffmanCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (&count, &min)) in self.counts.iter().zip(&self.min_codes).enumerate() {
            if count != 0 {
                let bits = i + 1;
                writeln!(f, "{bits} {min:0bits$b} x{count}")?;
            }
        }
        Ok(())
    }
}
