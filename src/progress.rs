/*
lptools, to make, dump and unpack Android logical partition images: progress bar module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use crate::Result;

const TEMPLATE_BYTES: &str =
    "{prefix} => [{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}";

fn progress_style_with_template<S: AsRef<str>>(template: S)
    -> Result<ProgressStyle>
{
    let template = template.as_ref();
    match ProgressStyle::with_template(template) {
        Ok(style) => Ok(style),
        Err(e) => {
            error!("Failed to create progress bar style from template '{}': {}",
                template, e);
            Err(e.into())
        }
    }
}

pub(crate) fn progress_bar_with_template<S>(length: u64, template: S)
    -> Result<ProgressBar>
where
    S: AsRef<str>,
{
    let style = progress_style_with_template(template)?;
    let bar = ProgressBar::new(length);
    bar.set_style(style);
    Ok(bar)
}

/// Byte-counting bar, e.g. "Writing super.img => [...]"
pub(crate) fn bytes_progress_bar<S: Into<String>>(length: u64, prefix: S)
    -> Result<ProgressBar>
{
    let bar = progress_bar_with_template(length, TEMPLATE_BYTES)?;
    bar.set_prefix(prefix.into());
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_bar_keeps_length() {
        let bar = bytes_progress_bar(4096, "Testing").unwrap();
        bar.inc(1024);
        assert_eq!(bar.length(), Some(4096));
        assert_eq!(bar.position(), 1024);
        assert_eq!(bar.prefix(), "Testing");
    }
}
