// SPDX-License-Identifier: Apache-2.0

pub(crate) mod bundle;
pub(crate) mod oci;
pub(crate) mod reference;
pub(crate) mod statement;
