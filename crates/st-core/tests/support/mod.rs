pub mod sim_harness;
