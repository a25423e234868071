mod repatch;
