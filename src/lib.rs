/// Copyright: Kyler Chin <kyler@catenarymaps.org>
/// Catenary Transit Initiatives
/// Removal of the attribution is not allowed, as covered under the AGPL license

pub mod config;
pub mod departures;
pub mod naptan;
pub mod nationalrail;
pub mod optis;
pub mod pubsub;
pub mod repository;
pub mod siri;
pub mod transxchange;
