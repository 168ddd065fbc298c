// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! RPM repository metadata XML definitions.

RPM repositories define metadata via a series of XML files. `repodata/repomd.xml`
is the entry point and lists the other files. This module defines parsed forms of
these documents, as well as the writer of new `repomd.xml` manifests.
*/

pub mod primary;
pub mod repomd;
