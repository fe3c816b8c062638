mod end_to_end;
mod runner;
mod watchdog;
