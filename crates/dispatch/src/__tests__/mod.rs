mod drain;
mod helpers;
mod scheduling;
