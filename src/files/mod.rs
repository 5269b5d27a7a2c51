// SPDX-License-Identifier: AGPL-3.0-or-later
// Pure path transforms (no filesystem access)
pub mod path;
