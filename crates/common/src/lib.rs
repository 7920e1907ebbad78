// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

pub mod tracing;

/// Build information stamped in at compile time.
pub mod build {
    pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
    pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

    /// The banner remote peers see in status replies, e.g. `3D-Rapic TxDevice 0.9.0-alpha`.
    pub fn txdevice_banner() -> String {
        format!("3D-Rapic TxDevice {PKG_VERSION}")
    }
}

#[cfg(test)]
mod tests {
    use super::build;
    use pretty_assertions::assert_eq;

    #[test]
    fn banner_carries_version() {
        assert_eq!(
            build::txdevice_banner(),
            format!("3D-Rapic TxDevice {}", build::PKG_VERSION)
        );
    }
}
